//! Performance-regression alerts raised as snapshots arrive.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use tabscope_core::types::{PerformanceBaseline, PerformanceSnapshot};

pub const MAX_PENDING_ALERTS: usize = 10;

const LOAD_REGRESSION_PCT: f64 = 20.0;
const FCP_REGRESSION_PCT: f64 = 20.0;
const LCP_REGRESSION_PCT: f64 = 20.0;
const TTFB_REGRESSION_PCT: f64 = 50.0;
const CLS_REGRESSION_ABS: f64 = 0.1;
const TRANSFER_REGRESSION_PCT: f64 = 25.0;

const RECOMMENDATION: &str =
    "Check recently added scripts or stylesheets. Use analyze with what=performance for full details.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDelta {
    pub baseline: f64,
    pub current: f64,
    /// Milliseconds for timings, bytes for transfer size, raw score for CLS.
    pub delta_ms: f64,
    pub delta_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceAlert {
    pub id: u64,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub url: String,
    pub detected_at: String,
    pub summary: String,
    pub metrics: BTreeMap<String, MetricDelta>,
    pub recommendation: String,
    #[serde(skip)]
    pub delivered_at: u64,
}

/// Metrics of `snapshot` that regressed past their threshold against `baseline`.
pub fn regressed_metrics(snapshot: &PerformanceSnapshot, baseline: &PerformanceBaseline) -> BTreeMap<String, MetricDelta> {
    let mut metrics = BTreeMap::new();
    let mut relative = |name: &str, base: f64, current: f64, threshold_pct: f64| {
        if base <= 0.0 {
            return;
        }
        let delta = current - base;
        let pct = delta / base * 100.0;
        if pct > threshold_pct {
            metrics.insert(
                name.to_string(),
                MetricDelta {
                    baseline: base,
                    current,
                    delta_ms: delta,
                    delta_pct: pct,
                },
            );
        }
    };

    let (bt, st) = (&baseline.timing, &snapshot.timing);
    relative("load", bt.load, st.load, LOAD_REGRESSION_PCT);
    if let (Some(b), Some(s)) = (bt.first_contentful_paint, st.first_contentful_paint) {
        relative("fcp", b, s, FCP_REGRESSION_PCT);
    }
    if let (Some(b), Some(s)) = (bt.largest_contentful_paint, st.largest_contentful_paint) {
        relative("lcp", b, s, LCP_REGRESSION_PCT);
    }
    relative("ttfb", bt.time_to_first_byte, st.time_to_first_byte, TTFB_REGRESSION_PCT);
    relative(
        "transfer_bytes",
        baseline.network.transfer_size as f64,
        snapshot.network.transfer_size as f64,
        TRANSFER_REGRESSION_PCT,
    );

    if let (Some(b), Some(s)) = (baseline.cls, snapshot.cls) {
        let delta = s - b;
        if delta > CLS_REGRESSION_ABS {
            let pct = if b > 0.0 { delta / b * 100.0 } else { 0.0 };
            metrics.insert(
                "cls".to_string(),
                MetricDelta {
                    baseline: b,
                    current: s,
                    delta_ms: delta,
                    delta_pct: pct,
                },
            );
        }
    }
    metrics
}

fn alert_summary(url: &str, metrics: &BTreeMap<String, MetricDelta>) -> String {
    if let Some(load) = metrics.get("load") {
        return format!(
            "Load time regressed by {:.0}ms ({:.0}ms -> {:.0}ms) on {}",
            load.delta_ms, load.baseline, load.current, url
        );
    }
    match metrics.iter().next() {
        Some((name, m)) => format!("{} regressed by {:.1}% on {}", name, m.delta_pct, url),
        None => format!("Performance regression detected on {}", url),
    }
}

#[derive(Default)]
struct AlertState {
    pending: Vec<PerformanceAlert>,
    counter: u64,
    delivery: u64,
}

/// Capped queue of undelivered-or-recent regression alerts, at most one per URL.
///
/// Delivery is tracked with a monotonic counter: [`AlertTracker::mark_delivered`]
/// stamps the current counter onto fresh alerts, and
/// [`AlertTracker::pending_alerts`] with a counter `c` returns alerts that are
/// undelivered or were delivered after `c`.
#[derive(Default)]
pub struct AlertTracker {
    state: Mutex<AlertState>,
}

impl AlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Compares a fresh snapshot with the URL's prior baseline. A clean snapshot
    /// resolves any alert for the URL; a regression replaces it.
    pub fn observe_snapshot(
        &self,
        snapshot: &PerformanceSnapshot,
        baseline: Option<&PerformanceBaseline>,
    ) -> Option<PerformanceAlert> {
        let baseline = baseline.filter(|b| b.sample_count >= 1)?;
        let metrics = regressed_metrics(snapshot, baseline);
        let url = snapshot.url.as_str();

        let mut st = self.lock();
        st.pending.retain(|a| a.url != url);
        if metrics.is_empty() {
            return None;
        }

        st.counter += 1;
        st.delivery += 1;
        let alert = PerformanceAlert {
            id: st.counter,
            alert_type: "regression".to_string(),
            url: url.to_string(),
            detected_at: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            summary: alert_summary(url, &metrics),
            metrics,
            recommendation: RECOMMENDATION.to_string(),
            delivered_at: 0,
        };
        info!(id = alert.id, url, summary = %alert.summary, "Performance regression");
        st.pending.push(alert.clone());
        if st.pending.len() > MAX_PENDING_ALERTS {
            let excess = st.pending.len() - MAX_PENDING_ALERTS;
            st.pending.drain(..excess);
        }
        Some(alert)
    }

    pub fn pending_alerts(&self, since_delivery: u64) -> Vec<PerformanceAlert> {
        self.lock()
            .pending
            .iter()
            .filter(|a| a.delivered_at == 0 || a.delivered_at > since_delivery)
            .cloned()
            .collect()
    }

    pub fn mark_delivered(&self) {
        let mut st = self.lock();
        let stamp = st.delivery;
        for alert in st.pending.iter_mut().filter(|a| a.delivered_at == 0) {
            alert.delivered_at = stamp;
        }
    }

    pub fn delivery_counter(&self) -> u64 {
        self.lock().delivery
    }

    pub fn all(&self) -> Vec<PerformanceAlert> {
        self.lock().pending.clone()
    }

    pub fn clear(&self) -> usize {
        let mut st = self.lock();
        let n = st.pending.len();
        st.pending.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabscope_core::types::{BaselineNetwork, PerformanceTiming};

    fn baseline(url: &str, samples: u32) -> PerformanceBaseline {
        PerformanceBaseline {
            url: url.to_string(),
            sample_count: samples,
            timing: PerformanceTiming {
                load: 1000.0,
                time_to_first_byte: 100.0,
                first_contentful_paint: Some(500.0),
                ..Default::default()
            },
            network: BaselineNetwork {
                request_count: 10,
                transfer_size: 100_000,
            },
            cls: Some(0.02),
            ..Default::default()
        }
    }

    fn snapshot(url: &str, load: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            url: url.to_string(),
            timing: PerformanceTiming {
                load,
                time_to_first_byte: 100.0,
                first_contentful_paint: Some(500.0),
                ..Default::default()
            },
            network: tabscope_core::types::NetworkSummary {
                request_count: 10,
                transfer_size: 100_000,
                decoded_size: 0,
            },
            cls: Some(0.02),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_prior_samples_never_alerts() {
        let tracker = AlertTracker::new();
        assert!(tracker.observe_snapshot(&snapshot("/a", 5000.0), Some(&baseline("/a", 0))).is_none());
        assert!(tracker.observe_snapshot(&snapshot("/a", 5000.0), None).is_none());
        assert!(tracker.all().is_empty());
    }

    #[test]
    fn test_load_regression_summary() {
        let tracker = AlertTracker::new();
        let alert = tracker
            .observe_snapshot(&snapshot("/a", 1500.0), Some(&baseline("/a", 3)))
            .unwrap();
        assert_eq!(alert.summary, "Load time regressed by 500ms (1000ms -> 1500ms) on /a");
        assert!(alert.metrics.contains_key("load"));
        assert_eq!(alert.alert_type, "regression");
    }

    #[test]
    fn test_thresholds() {
        let b = baseline("/a", 2);
        let mut s = snapshot("/a", 1150.0);
        s.timing.time_to_first_byte = 160.0;
        s.cls = Some(0.2);
        s.network.transfer_size = 124_000;
        let m = regressed_metrics(&s, &b);
        assert!(!m.contains_key("load"));
        assert!(m.contains_key("ttfb"));
        assert!(m.contains_key("cls"));
        assert!(!m.contains_key("transfer_bytes"));
        assert!((m["cls"].delta_ms - 0.18).abs() < 1e-9);
    }

    #[test]
    fn test_matching_snapshot_clears_alert() {
        let tracker = AlertTracker::new();
        tracker.observe_snapshot(&snapshot("/a", 2000.0), Some(&baseline("/a", 1)));
        assert_eq!(tracker.all().len(), 1);
        assert!(tracker.observe_snapshot(&snapshot("/a", 1000.0), Some(&baseline("/a", 2))).is_none());
        assert!(tracker.all().is_empty());
    }

    #[test]
    fn test_one_alert_per_url() {
        let tracker = AlertTracker::new();
        tracker.observe_snapshot(&snapshot("/a", 2000.0), Some(&baseline("/a", 1)));
        tracker.observe_snapshot(&snapshot("/a", 3000.0), Some(&baseline("/a", 1)));
        let alerts = tracker.all();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, 2);
    }

    #[test]
    fn test_queue_cap_evicts_oldest() {
        let tracker = AlertTracker::new();
        for i in 0..(MAX_PENDING_ALERTS + 2) {
            let url = format!("/p{}", i);
            tracker.observe_snapshot(&snapshot(&url, 2000.0), Some(&baseline(&url, 1)));
        }
        let alerts = tracker.all();
        assert_eq!(alerts.len(), MAX_PENDING_ALERTS);
        assert_eq!(alerts[0].url, "/p2");
    }

    #[test]
    fn test_delivery_idempotence() {
        let tracker = AlertTracker::new();
        tracker.observe_snapshot(&snapshot("/a", 2000.0), Some(&baseline("/a", 1)));
        assert_eq!(tracker.pending_alerts(0).len(), 1);
        tracker.mark_delivered();
        let counter = tracker.delivery_counter();
        assert!(tracker.pending_alerts(counter).is_empty());
        assert!(tracker.pending_alerts(counter).is_empty());
        assert_eq!(tracker.pending_alerts(0).len(), 1);
    }
}
