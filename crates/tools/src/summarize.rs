//! Compresses noisy console logs into fingerprint groups plus one-off anomalies.

use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

use tabscope_core::types::{level_rank, LogEntry};
use tabscope_core::{Error, Result};
use tabscope_storage::CaptureStore;

use crate::args;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;
pub const DEFAULT_MIN_GROUP_SIZE: usize = 2;
const MAX_FINGERPRINT_LEN: usize = 64;
const MIN_PERIODIC_SAMPLES: usize = 3;
const PERIODIC_MAX_CV: f64 = 0.20;

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

/// Placeholder substitutions, applied in order.
static NORMALIZERS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (re(r"\x1b\[[0-9;]*m"), ""),
        (
            re(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}"),
            "{uuid}",
        ),
        (re(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}[^\s]*"), "{timestamp}"),
        (re(r"https?://\S+"), "{url}"),
        (re(r"\b[0-9a-fA-F]{8,}\b"), "{hash}"),
        (re(r"\d{3,}"), "{n}"),
        (re(r#""[^"]{21,}""#), "\"{string}\""),
        (re(r"/[\w._-]+(/[\w._-]+)+"), "{path}"),
        (re(r"\s+"), " "),
    ]
});

static UNDERSCORE_RUNS: Lazy<Regex> = Lazy::new(|| re(r"_+"));

/// Built-in console noise: browser extension chatter and dev-tooling banners.
static NOISE_MESSAGES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(service.?worker|ServiceWorker).*(regist|install|activat|updated)",
        r"non-passive event listener",
        r"^\[Deprecation\]",
        r"DevTools failed to load source map",
        r"net::ERR_BLOCKED_BY_CLIENT",
        r"Indicate whether to send a cookie",
        r"third-party cookie will be blocked",
        r"^\[(vite|HMR|webpack|next)\]",
    ]
    .iter()
    .map(|p| re(p))
    .collect()
});
static NOISE_SOURCE: Lazy<Regex> = Lazy::new(|| re(r"(chrome|moz)-extension://"));

pub fn is_console_noise(entry: &LogEntry) -> bool {
    NOISE_SOURCE.is_match(&entry.source) || NOISE_MESSAGES.iter().any(|r| r.is_match(&entry.message))
}

/// Stable grouping key: variable parts replaced by placeholders, then slugified
/// to `[a-z0-9_]` and capped at 64 chars.
pub fn fingerprint(message: &str) -> String {
    if message.is_empty() {
        return String::new();
    }
    let mut s = message.to_string();
    for (pattern, replacement) in NORMALIZERS.iter() {
        s = pattern.replace_all(&s, *replacement).into_owned();
    }
    let slug: String = s
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let slug = UNDERSCORE_RUNS.replace_all(&slug, "_");
    let mut slug = slug.trim_matches('_').to_string();
    slug.truncate(MAX_FINGERPRINT_LEN);
    slug
}

// ─── Grouping ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct LogGroup {
    pub fingerprint: String,
    pub sample_message: String,
    pub count: usize,
    pub level_breakdown: BTreeMap<String, usize>,
    pub first_seen: String,
    pub last_seen: String,
    pub is_periodic: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub period_seconds: f64,
    pub source: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(skip)]
    timestamps: Vec<String>,
    #[serde(skip)]
    source_counts: HashMap<String, usize>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogAnomaly {
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
}

impl From<&LogEntry> for LogAnomaly {
    fn from(e: &LogEntry) -> Self {
        Self {
            level: e.level.clone(),
            message: e.message.clone(),
            source: e.source.clone(),
            url: e.url.clone(),
            line: e.line,
            column: e.column,
            timestamp: e.ts.clone(),
            tab_id: e.tab_id,
        }
    }
}

impl LogGroup {
    fn start(fp: String, first: &LogEntry) -> Self {
        let mut group = Self {
            fingerprint: fp,
            sample_message: String::new(),
            count: 0,
            level_breakdown: BTreeMap::new(),
            first_seen: String::new(),
            last_seen: String::new(),
            is_periodic: false,
            period_seconds: 0.0,
            source: String::new(),
            sources: Vec::new(),
            timestamps: Vec::new(),
            source_counts: HashMap::new(),
        };
        group.absorb(first);
        group
    }

    fn absorb(&mut self, entry: &LogEntry) {
        self.count += 1;
        *self.level_breakdown.entry(entry.level.clone()).or_insert(0) += 1;
        self.sample_message = entry.message.clone();
        if !entry.ts.is_empty() {
            if self.first_seen.is_empty() || entry.ts < self.first_seen {
                self.first_seen = entry.ts.clone();
            }
            if entry.ts > self.last_seen {
                self.last_seen = entry.ts.clone();
            }
            self.timestamps.push(entry.ts.clone());
        }
        if !entry.source.is_empty() {
            *self.source_counts.entry(entry.source.clone()).or_insert(0) += 1;
        }
    }

    fn resolve_sources(&mut self) {
        let mut all: Vec<String> = self.source_counts.keys().cloned().collect();
        all.sort();
        let mut best = 0;
        for src in &all {
            let c = self.source_counts[src];
            if c > best {
                best = c;
                self.source = src.clone();
            }
        }
        if all.len() > 1 {
            self.sources = all;
        }
    }
}

/// Single pass in arrival order. A fingerprint's first entry waits in pending;
/// the second promotes both into a group.
pub fn group_logs(entries: &[LogEntry], min_group_size: usize) -> (Vec<LogGroup>, Vec<LogAnomaly>) {
    let mut groups: Vec<LogGroup> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();
    let mut pending: Vec<Option<(String, &LogEntry)>> = Vec::new();
    let mut pending_index: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        let fp = fingerprint(&entry.message);
        if fp.is_empty() {
            continue;
        }
        if let Some(&i) = group_index.get(&fp) {
            groups[i].absorb(entry);
        } else if let Some(i) = pending_index.remove(&fp) {
            if let Some((fp, first)) = pending[i].take() {
                group_index.insert(fp.clone(), groups.len());
                let mut group = LogGroup::start(fp, first);
                group.absorb(entry);
                groups.push(group);
            }
        } else {
            pending_index.insert(fp.clone(), pending.len());
            pending.push(Some((fp, entry)));
        }
    }

    let mut anomalies = Vec::new();
    for (fp, entry) in pending.into_iter().flatten() {
        if min_group_size <= 1 {
            groups.push(LogGroup::start(fp, entry));
        } else {
            anomalies.push(LogAnomaly::from(entry));
        }
    }

    groups.retain(|g| g.count >= min_group_size);
    for g in &mut groups {
        g.resolve_sources();
    }
    groups.sort_by(|a, b| b.count.cmp(&a.count));
    anomalies.sort_by(|a, b| {
        level_rank(&b.level)
            .cmp(&level_rank(&a.level))
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });
    (groups, anomalies)
}

/// `(is_periodic, period_seconds)`: periodic when at least three timestamps
/// arrive at near-constant intervals (coefficient of variation below 0.2).
pub fn detect_periodicity(timestamps: &[String]) -> (bool, f64) {
    let mut times: Vec<f64> = timestamps
        .iter()
        .filter_map(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp_millis() as f64 / 1000.0)
        .collect();
    if times.len() < MIN_PERIODIC_SAMPLES {
        return (false, 0.0);
    }
    times.sort_by(|a, b| a.total_cmp(b));
    let intervals: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    if mean <= 0.0 {
        return (false, 0.0);
    }
    let variance = intervals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    if variance.sqrt() / mean < PERIODIC_MAX_CV {
        (true, (mean * 10.0).round() / 10.0)
    } else {
        (false, 0.0)
    }
}

// ─── observe(what="summarized_logs") ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogScope {
    CurrentPage,
    All,
}

impl LogScope {
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.unwrap_or("current_page") {
            "" | "current_page" => Ok(Self::CurrentPage),
            "all" => Ok(Self::All),
            other => Err(Error::invalid_param(
                "scope",
                format!("Invalid scope: {}. Use 'current_page' (default) or 'all'", other),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub limit: usize,
    pub level: Option<String>,
    pub min_level: Option<String>,
    pub source: Option<String>,
    pub url: Option<String>,
    pub scope: LogScope,
    pub min_group_size: usize,
}

impl SummaryRequest {
    pub fn from_params(params: &Value) -> Result<Self> {
        let scope = LogScope::parse(args::opt_str(params, "scope"))?;
        let min_group_size = match params.get("min_group_size").and_then(Value::as_i64) {
            Some(n) if n > 0 => n as usize,
            _ => DEFAULT_MIN_GROUP_SIZE,
        };
        Ok(Self {
            limit: args::limit(params, DEFAULT_LIMIT, MAX_LIMIT),
            level: args::opt_string(params, "level"),
            min_level: args::opt_string(params, "min_level"),
            source: args::opt_string(params, "source"),
            url: args::opt_string(params, "url"),
            scope,
            min_group_size,
        })
    }

    fn matches(&self, entry: &LogEntry, tracked_tab: Option<i64>) -> bool {
        if self.scope == LogScope::CurrentPage {
            if let Some(tab) = tracked_tab {
                if entry.tab_id != Some(tab) {
                    return false;
                }
            }
        }
        if self.level.as_deref().is_some_and(|l| l != entry.level) {
            return false;
        }
        if self
            .min_level
            .as_deref()
            .is_some_and(|min| level_rank(&entry.level) < level_rank(min))
        {
            return false;
        }
        if self.source.as_deref().is_some_and(|s| s != entry.source) {
            return false;
        }
        if let Some(needle) = &self.url {
            if !entry.url.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

pub fn summarize_logs(capture: &CaptureStore, req: &SummaryRequest) -> Value {
    let snapshot = capture.logs();
    let tracking = capture.tracking();
    let tracked_tab = tracking.tab_id.filter(|_| tracking.enabled);

    let mut noise_suppressed = 0;
    let mut views: Vec<LogEntry> = Vec::new();
    for entry in snapshot.entries.iter().rev() {
        if views.len() >= req.limit {
            break;
        }
        if entry.is_internal() {
            continue;
        }
        if is_console_noise(entry) {
            noise_suppressed += 1;
            continue;
        }
        if req.matches(entry, tracked_tab) {
            views.push(entry.clone());
        }
    }

    let (mut groups, anomalies) = group_logs(&views, req.min_group_size);
    for g in &mut groups {
        let (periodic, period) = detect_periodicity(&g.timestamps);
        g.is_periodic = periodic;
        g.period_seconds = period;
    }

    let total = views.len();
    let compression_ratio = if total > 0 {
        ((1.0 - (groups.len() + anomalies.len()) as f64 / total as f64) * 100.0).round() / 100.0
    } else {
        0.0
    };
    let stamps = views.iter().map(|v| v.ts.as_str()).filter(|t| !t.is_empty());
    let start = stamps.clone().min().unwrap_or_default();
    let end = stamps.max().unwrap_or_default();

    json!({
        "groups": groups,
        "anomalies": anomalies,
        "summary": {
            "total_entries": total,
            "groups": groups.len(),
            "anomalies": anomalies.len(),
            "noise_suppressed": noise_suppressed,
            "compression_ratio": compression_ratio,
            "time_range": { "start": start, "end": end },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabscope_core::Config;
    use tabscope_storage::TrackingStatus;

    fn entry(level: &str, msg: &str, ts: &str) -> LogEntry {
        LogEntry {
            level: level.into(),
            message: msg.into(),
            source: "app.js".into(),
            ts: ts.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_ignores_numbers() {
        assert_eq!(fingerprint("User 123 logged in"), fingerprint("User 456 logged in"));
        assert_eq!(fingerprint("User 123 logged in"), "user_n_logged_in");
        assert_eq!(fingerprint(""), "");
    }

    #[test]
    fn test_anomaly_omits_missing_fields() {
        let bare = LogEntry {
            level: "error".into(),
            message: "boom".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(LogAnomaly::from(&bare)).unwrap();
        assert_eq!(v, serde_json::json!({"level": "error", "message": "boom"}));

        let full = LogEntry {
            line: Some(12),
            tab_id: Some(3),
            ..entry("error", "boom", "2026-01-01T00:00:00Z")
        };
        let v = serde_json::to_value(LogAnomaly::from(&full)).unwrap();
        assert_eq!(v["line"], 12);
        assert_eq!(v["tab_id"], 3);
        assert_eq!(v["source"], "app.js");
        assert!(v.get("column").is_none());
    }

    #[test]
    fn test_fingerprint_charset_and_length() {
        let msgs = [
            "\x1b[31mFailed\x1b[0m to GET https://api.test/v1/users?id=9 at 2024-01-01T10:00:00.123Z",
            "Token deadbeefcafe1234 rejected for /usr/local/lib/thing.js",
            "Request 550e8400-e29b-41d4-a716-446655440000 \"some really long quoted string here\"",
            &"very long message ".repeat(20),
            "日本語のエラー",
        ];
        for m in msgs {
            let fp = fingerprint(m);
            assert!(fp.len() <= 64, "{}", fp);
            assert!(fp.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'), "{}", fp);
        }
        assert_eq!(
            fingerprint("GET https://a.test/x failed"),
            fingerprint("GET https://b.test/y?z=1 failed")
        );
    }

    #[test]
    fn test_three_identical_make_one_group() {
        let logs = vec![
            entry("error", "boom", "2024-01-01T00:00:01Z"),
            entry("error", "boom", "2024-01-01T00:00:02Z"),
            entry("error", "boom", "2024-01-01T00:00:03Z"),
        ];
        let (groups, anomalies) = group_logs(&logs, 2);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 3);
        assert_eq!(groups[0].level_breakdown["error"], 3);
        assert_eq!(groups[0].first_seen, "2024-01-01T00:00:01Z");
        assert_eq!(groups[0].last_seen, "2024-01-01T00:00:03Z");
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_repeat_plus_unique() {
        let logs = vec![
            entry("warn", "retrying 1000", ""),
            entry("error", "fatal", ""),
            entry("warn", "retrying 2000", ""),
        ];
        let (groups, anomalies) = group_logs(&logs, 2);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 2);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].message, "fatal");
    }

    #[test]
    fn test_min_group_size_one_keeps_singletons() {
        let logs = vec![entry("info", "a", ""), entry("info", "b", "")];
        let (groups, anomalies) = group_logs(&logs, 1);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.count == 1));
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_anomalies_sorted_by_severity_then_recency() {
        let logs = vec![
            entry("warn", "w", "2024-01-01T00:00:05Z"),
            entry("error", "e1", "2024-01-01T00:00:01Z"),
            entry("error", "e2", "2024-01-01T00:00:02Z"),
        ];
        let (_, anomalies) = group_logs(&logs, 2);
        let order: Vec<&str> = anomalies.iter().map(|a| a.message.as_str()).collect();
        assert_eq!(order, vec!["e2", "e1", "w"]);
    }

    #[test]
    fn test_multiple_sources() {
        let mut a = entry("error", "x", "");
        a.source = "a.js".into();
        let mut b = entry("error", "x", "");
        b.source = "b.js".into();
        let (groups, _) = group_logs(&[a.clone(), b, a], 2);
        assert_eq!(groups[0].source, "a.js");
        assert_eq!(groups[0].sources, vec!["a.js".to_string(), "b.js".to_string()]);
    }

    #[test]
    fn test_periodicity() {
        let even: Vec<String> = ["00", "03", "06", "09"]
            .iter()
            .map(|s| format!("2024-01-01T00:00:{}Z", s))
            .collect();
        let (periodic, period) = detect_periodicity(&even);
        assert!(periodic);
        assert!((period - 3.0).abs() < 1e-9);

        let uneven: Vec<String> = ["00", "01", "19", "20"]
            .iter()
            .map(|s| format!("2024-01-01T00:00:{}Z", s))
            .collect();
        assert!(!detect_periodicity(&uneven).0);
        assert!(!detect_periodicity(&even[..2]).0);
    }

    #[test]
    fn test_scope_validation() {
        assert!(SummaryRequest::from_params(&json!({"scope": "all"})).is_ok());
        match SummaryRequest::from_params(&json!({"scope": "tab"})) {
            Err(Error::InvalidParam { param, .. }) => assert_eq!(param, "scope"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_summarize_filters_and_counts() {
        let cap = CaptureStore::new(&Config::default());
        let mut other_tab = entry("error", "boom", "2024-01-01T00:00:04Z");
        other_tab.tab_id = Some(2);
        let mut tracked = vec![
            entry("error", "boom", "2024-01-01T00:00:01Z"),
            entry("error", "boom", "2024-01-01T00:00:02Z"),
            entry("warn", "[Deprecation] old api", "2024-01-01T00:00:03Z"),
        ];
        for e in &mut tracked {
            e.tab_id = Some(1);
        }
        tracked.push(other_tab);
        cap.add_logs(tracked);
        cap.set_tracking(TrackingStatus {
            enabled: true,
            tab_id: Some(1),
            ..Default::default()
        });

        let req = SummaryRequest::from_params(&json!({})).unwrap();
        let out = summarize_logs(&cap, &req);
        assert_eq!(out["summary"]["total_entries"], 2);
        assert_eq!(out["summary"]["noise_suppressed"], 1);
        assert_eq!(out["summary"]["groups"], 1);
        assert_eq!(out["summary"]["compression_ratio"], 0.5);
        assert_eq!(out["summary"]["time_range"]["start"], "2024-01-01T00:00:01Z");

        let all = SummaryRequest::from_params(&json!({"scope": "all"})).unwrap();
        assert_eq!(summarize_logs(&cap, &all)["summary"]["total_entries"], 3);
    }
}
