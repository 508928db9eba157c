//! Latest snapshot and rolling baseline per page URL, both LRU-capped.

use std::collections::{HashMap, VecDeque};
use tabscope_core::types::{BaselineNetwork, PerformanceBaseline, PerformanceSnapshot};

pub const MAX_TRACKED_URLS: usize = 50;

/// Below this many samples the baseline is a plain running mean; afterwards it
/// becomes an 80/20 exponentially weighted average.
const WARMUP_SAMPLES: u32 = 5;

#[derive(Debug, Default)]
pub struct PerformanceStore {
    snapshots: HashMap<String, PerformanceSnapshot>,
    snapshot_order: VecDeque<String>,
    baselines: HashMap<String, PerformanceBaseline>,
    baseline_order: VecDeque<String>,
}

fn touch(order: &mut VecDeque<String>, key: &str) {
    order.retain(|k| k != key);
    order.push_back(key.to_string());
}

fn avg_optional(baseline: Option<f64>, sample: Option<f64>, n: f64) -> Option<f64> {
    match (baseline, sample) {
        (_, None) => baseline,
        (None, Some(s)) => Some(s),
        (Some(b), Some(s)) => Some(b * (n - 1.0) / n + s / n),
    }
}

fn weighted_optional(baseline: Option<f64>, sample: Option<f64>) -> Option<f64> {
    match (baseline, sample) {
        (_, None) => baseline,
        (None, Some(s)) => Some(s),
        (Some(b), Some(s)) => Some(b * 0.8 + s * 0.2),
    }
}

impl PerformanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `snapshot` and folds it into the URL's baseline. Returns the
    /// baseline as it was before this sample, which is what regressions are
    /// measured against.
    pub fn add_snapshot(&mut self, snapshot: PerformanceSnapshot) -> Option<PerformanceBaseline> {
        let url = snapshot.url.clone();
        if !self.snapshots.contains_key(&url) && self.snapshot_order.len() >= MAX_TRACKED_URLS {
            if let Some(oldest) = self.snapshot_order.pop_front() {
                self.snapshots.remove(&oldest);
            }
        }
        touch(&mut self.snapshot_order, &url);
        let prior = self.baselines.get(&url).cloned();
        self.update_baseline(&snapshot);
        self.snapshots.insert(url, snapshot);
        prior
    }

    fn update_baseline(&mut self, snap: &PerformanceSnapshot) {
        let url = snap.url.as_str();
        let Some(base) = self.baselines.get_mut(url) else {
            if self.baseline_order.len() >= MAX_TRACKED_URLS {
                if let Some(oldest) = self.baseline_order.pop_front() {
                    self.baselines.remove(&oldest);
                }
            }
            let mut timing = snap.timing.clone();
            timing.interaction_to_next_paint = None;
            self.baselines.insert(
                url.to_string(),
                PerformanceBaseline {
                    url: url.to_string(),
                    sample_count: 1,
                    last_updated: snap.timestamp.clone(),
                    timing,
                    network: BaselineNetwork {
                        request_count: snap.network.request_count,
                        transfer_size: snap.network.transfer_size,
                    },
                    long_tasks: snap.long_tasks.clone(),
                    cls: snap.cls,
                },
            );
            self.baseline_order.push_back(url.to_string());
            return;
        };

        base.sample_count += 1;
        base.last_updated = snap.timestamp.clone();

        let (keep, take): (f64, f64) = if base.sample_count < WARMUP_SAMPLES {
            let n = base.sample_count as f64;
            ((n - 1.0) / n, 1.0 / n)
        } else {
            (0.8, 0.2)
        };
        let blend = |b: f64, s: f64| b * keep + s * take;
        let blend_int = |b: i64, s: i64| (b as f64 * keep + s as f64 * take) as i64;

        let t = &mut base.timing;
        t.dom_content_loaded = blend(t.dom_content_loaded, snap.timing.dom_content_loaded);
        t.load = blend(t.load, snap.timing.load);
        t.time_to_first_byte = blend(t.time_to_first_byte, snap.timing.time_to_first_byte);
        t.dom_interactive = blend(t.dom_interactive, snap.timing.dom_interactive);
        base.network.request_count = blend_int(base.network.request_count, snap.network.request_count);
        base.network.transfer_size = blend_int(base.network.transfer_size, snap.network.transfer_size);
        base.long_tasks.count = blend_int(base.long_tasks.count, snap.long_tasks.count);
        base.long_tasks.total_blocking_time =
            blend(base.long_tasks.total_blocking_time, snap.long_tasks.total_blocking_time);
        base.long_tasks.longest = blend(base.long_tasks.longest, snap.long_tasks.longest);

        if base.sample_count < WARMUP_SAMPLES {
            let n = base.sample_count as f64;
            t.first_contentful_paint = avg_optional(t.first_contentful_paint, snap.timing.first_contentful_paint, n);
            t.largest_contentful_paint =
                avg_optional(t.largest_contentful_paint, snap.timing.largest_contentful_paint, n);
            base.cls = avg_optional(base.cls, snap.cls, n);
        } else {
            t.first_contentful_paint = weighted_optional(t.first_contentful_paint, snap.timing.first_contentful_paint);
            t.largest_contentful_paint =
                weighted_optional(t.largest_contentful_paint, snap.timing.largest_contentful_paint);
            base.cls = weighted_optional(base.cls, snap.cls);
        }
        touch(&mut self.baseline_order, url);
    }

    pub fn snapshot(&self, url: &str) -> Option<&PerformanceSnapshot> {
        self.snapshots.get(url)
    }

    pub fn latest_snapshot(&self) -> Option<&PerformanceSnapshot> {
        self.snapshot_order.back().and_then(|url| self.snapshots.get(url))
    }

    pub fn baseline(&self, url: &str) -> Option<&PerformanceBaseline> {
        self.baselines.get(url)
    }

    /// Snapshots, most recently updated first.
    pub fn snapshots(&self) -> Vec<PerformanceSnapshot> {
        self.snapshot_order
            .iter()
            .rev()
            .filter_map(|url| self.snapshots.get(url).cloned())
            .collect()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.snapshots.len();
        self.snapshots.clear();
        self.snapshot_order.clear();
        self.baselines.clear();
        self.baseline_order.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabscope_core::types::PerformanceTiming;

    fn snap(url: &str, load: f64, fcp: Option<f64>) -> PerformanceSnapshot {
        PerformanceSnapshot {
            url: url.to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            timing: PerformanceTiming {
                load,
                first_contentful_paint: fcp,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_first_sample_has_no_prior_baseline() {
        let mut store = PerformanceStore::new();
        assert!(store.add_snapshot(snap("/a", 1000.0, None)).is_none());
        let b = store.baseline("/a").unwrap();
        assert_eq!(b.sample_count, 1);
        assert_eq!(b.timing.load, 1000.0);
    }

    #[test]
    fn test_running_average_then_weighted() {
        let mut store = PerformanceStore::new();
        store.add_snapshot(snap("/a", 1000.0, Some(100.0)));
        let prior = store.add_snapshot(snap("/a", 2000.0, Some(300.0))).unwrap();
        assert_eq!(prior.timing.load, 1000.0);
        let b = store.baseline("/a").unwrap();
        assert_eq!(b.sample_count, 2);
        assert!((b.timing.load - 1500.0).abs() < 1e-9);
        assert!((b.timing.first_contentful_paint.unwrap() - 200.0).abs() < 1e-9);

        for _ in 0..2 {
            store.add_snapshot(snap("/a", 1500.0, None));
        }
        assert_eq!(store.baseline("/a").unwrap().sample_count, 4);
        store.add_snapshot(snap("/a", 2500.0, None));
        let b = store.baseline("/a").unwrap();
        assert_eq!(b.sample_count, 5);
        assert!((b.timing.load - (1500.0 * 0.8 + 2500.0 * 0.2)).abs() < 1e-9);
        // missing samples keep the previous value
        assert!((b.timing.first_contentful_paint.unwrap() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_lru_eviction() {
        let mut store = PerformanceStore::new();
        for i in 0..(MAX_TRACKED_URLS + 3) {
            store.add_snapshot(snap(&format!("/p{}", i), 1.0, None));
        }
        assert!(store.snapshot("/p0").is_none());
        assert!(store.baseline("/p2").is_none());
        assert!(store.snapshot("/p3").is_some());
        assert_eq!(store.latest_snapshot().unwrap().url, format!("/p{}", MAX_TRACKED_URLS + 2));
    }
}
