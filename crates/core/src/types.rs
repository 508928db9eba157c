//! Typed telemetry records pushed by the browser extension.
//!
//! Field names follow the extension's wire format. Untyped JSON is parsed into
//! these structs at the HTTP boundary and never travels further as a raw map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero_i64(n: &i64) -> bool {
    *n == 0
}

/// A console log entry captured from the tracked page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub level: String,
    #[serde(default, alias = "msg")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
    #[serde(default, alias = "timestamp")]
    pub ts: String,
    #[serde(default, rename = "tabId", alias = "tab_id", skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub entry_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stack: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
}

impl LogEntry {
    /// Entries the extension emits about itself rather than the page.
    pub fn is_internal(&self) -> bool {
        matches!(self.entry_type.as_str(), "lifecycle" | "tracking" | "extension")
    }
}

/// Severity rank used by `min_level` filters and anomaly ordering.
pub fn level_rank(level: &str) -> i32 {
    match level {
        "debug" => 0,
        "log" | "info" => 1,
        "warn" | "warning" => 2,
        "error" => 3,
        _ => -1,
    }
}

/// Internal diagnostics the extension reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionLog {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// One `PerformanceResourceTiming` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkWaterfallEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub initiator_type: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub fetch_start: f64,
    #[serde(default)]
    pub response_end: f64,
    #[serde(default)]
    pub transfer_size: i64,
    #[serde(default)]
    pub decoded_body_size: i64,
    #[serde(default)]
    pub encoded_body_size: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub page_url: String,
    /// When the extension recorded the entry. Left at the epoch when the
    /// payload omits it; the store then stamps the arrival time.
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

/// Batch posted to `/network-waterfall`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkWaterfallPayload {
    #[serde(default)]
    pub entries: Vec<NetworkWaterfallEntry>,
    #[serde(default)]
    pub page_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkBody {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ts: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub duration: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub request_truncated: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub response_truncated: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_auth_header: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
}

impl NetworkBody {
    pub fn estimated_size(&self) -> usize {
        self.request_body.len() + self.response_body.len() + 300
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSocketEvent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ts: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub event_type: String,
    /// `open`, `message`, `close` or `error`.
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub direction: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub size: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub code: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub binary_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
}

impl WebSocketEvent {
    pub fn estimated_size(&self) -> usize {
        self.data.len() + 200
    }
}

/// A captured user interaction with its selector candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnhancedAction {
    #[serde(default, rename = "type")]
    pub action_type: String,
    /// Unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, rename = "inputType", skip_serializing_if = "String::is_empty")]
    pub input_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, rename = "fromUrl", skip_serializing_if = "String::is_empty")]
    pub from_url: String,
    #[serde(default, rename = "toUrl", skip_serializing_if = "String::is_empty")]
    pub to_url: String,
    #[serde(default, rename = "selectedValue", skip_serializing_if = "String::is_empty")]
    pub selected_value: String,
    #[serde(default, rename = "selectedText", skip_serializing_if = "String::is_empty")]
    pub selected_text: String,
    #[serde(default, rename = "scrollY", skip_serializing_if = "is_zero_i64")]
    pub scroll_y: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTiming {
    #[serde(default)]
    pub dom_content_loaded: f64,
    #[serde(default)]
    pub load: f64,
    #[serde(default)]
    pub first_contentful_paint: Option<f64>,
    #[serde(default)]
    pub largest_contentful_paint: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_to_next_paint: Option<f64>,
    #[serde(default)]
    pub time_to_first_byte: f64,
    #[serde(default)]
    pub dom_interactive: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSummary {
    #[serde(default)]
    pub request_count: i64,
    #[serde(default)]
    pub transfer_size: i64,
    #[serde(default)]
    pub decoded_size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LongTaskMetrics {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub total_blocking_time: f64,
    #[serde(default)]
    pub longest: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub url: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub timing: PerformanceTiming,
    #[serde(default)]
    pub network: NetworkSummary,
    #[serde(default)]
    pub long_tasks: LongTaskMetrics,
    #[serde(default, rename = "cumulative_layout_shift", skip_serializing_if = "Option::is_none")]
    pub cls: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineNetwork {
    pub request_count: i64,
    pub transfer_size: i64,
}

/// Rolling per-URL average of performance snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub url: String,
    pub sample_count: u32,
    pub last_updated: String,
    pub timing: PerformanceTiming,
    pub network: BaselineNetwork,
    pub long_tasks: LongTaskMetrics,
    #[serde(rename = "cumulative_layout_shift", skip_serializing_if = "Option::is_none")]
    pub cls: Option<f64>,
}
