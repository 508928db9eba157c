//! "What changed since X" across console, network, websocket and action buffers.
//!
//! A checkpoint records the buffer positions at one moment plus the last seen
//! status and latency of every network endpoint. Unnamed queries diff against
//! an implicit auto checkpoint that advances after every such query; named
//! checkpoints stay put until overwritten.

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use tabscope_core::types::{NetworkBody, WebSocketEvent};
use tabscope_core::{Error, Result};
use tabscope_storage::{BufferPositions, BufferSnapshot, CaptureStore};

use crate::alerts::{AlertTracker, PerformanceAlert};
use crate::safe_truncate;

pub const MAX_NAMED_CHECKPOINTS: usize = 20;
pub const MAX_CHECKPOINT_NAME_LEN: usize = 50;
const MAX_DIFF_ENTRIES: usize = 50;
const MAX_MESSAGE_LEN: usize = 200;
const DEGRADED_LATENCY_FACTOR: i64 = 3;

pub const DIFF_CATEGORIES: [&str; 4] = ["console", "network", "websocket", "actions"];

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}").expect("valid regex")
});
static ISO_TS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z?").expect("valid regex"));
static LARGE_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{4,}\b").expect("valid regex"));

/// Dedupe key for console diffs: ids, timestamps and long numbers blanked out.
fn dedupe_key(msg: &str) -> String {
    let s = UUID_RE.replace_all(msg, "{uuid}");
    let s = ISO_TS_RE.replace_all(&s, "{ts}");
    LARGE_NUMBER_RE.replace_all(&s, "{n}").into_owned()
}

/// Path component of a request URL, used as the endpoint identity.
pub fn url_path(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(u) => u.path().to_string(),
        Err(_) => raw.split(['?', '#']).next().unwrap_or(raw).to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct EndpointState {
    status: i64,
    duration: i64,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub positions: BufferPositions,
    pub alert_delivery: u64,
    known_endpoints: HashMap<String, EndpointState>,
}

impl Checkpoint {
    fn beginning(created_at: DateTime<Utc>) -> Self {
        Self {
            name: String::new(),
            created_at,
            positions: BufferPositions::default(),
            alert_delivery: 0,
            known_endpoints: HashMap::new(),
        }
    }
}

// ─── Diff types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsoleEntry {
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsoleDiff {
    pub total_new: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ConsoleEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ConsoleEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkFailure {
    pub path: String,
    pub status: i64,
    pub previous_status: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkDegraded {
    pub path: String,
    pub duration_ms: i64,
    pub baseline_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkDiff {
    pub total_new: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<NetworkFailure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_endpoints: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<NetworkDegraded>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsConnection {
    pub url: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsDisconnection {
    pub url: String,
    pub close_code: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub close_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsError {
    pub url: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WebSocketDiff {
    pub total_new: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<WsConnection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disconnections: Vec<WsDisconnection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<WsError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionEntry {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionsDiff {
    pub total_new: usize,
    pub actions: Vec<ActionEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffResponse {
    pub from: String,
    pub to: String,
    pub duration_ms: i64,
    pub severity: String,
    pub summary: String,
    pub token_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket: Option<WebSocketDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<ActionsDiff>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub performance_alerts: Vec<PerformanceAlert>,
}

#[derive(Debug, Clone, Default)]
pub struct DiffRequest {
    /// Named checkpoint or RFC3339 timestamp; empty means the auto checkpoint.
    pub checkpoint: String,
    /// Subset of [`DIFF_CATEGORIES`]; empty means all.
    pub include: Vec<String>,
    pub errors_only: bool,
}

// ─── Diff computation ────────────────────────────────────────────────────────

fn new_entries<T>(snapshot: &BufferSnapshot<T>, since: u64) -> impl Iterator<Item = &T> {
    snapshot
        .sequenced()
        .filter(move |(seq, _, _)| *seq > since)
        .map(|(_, _, entry)| entry)
}

fn add_console_entry(entries: &mut Vec<ConsoleEntry>, index: &mut HashMap<String, usize>, msg: &str, source: &str) {
    let key = dedupe_key(msg);
    if let Some(&i) = index.get(&key) {
        entries[i].count += 1;
        return;
    }
    index.insert(key, entries.len());
    entries.push(ConsoleEntry {
        message: safe_truncate(msg, MAX_MESSAGE_LEN).to_string(),
        source: source.to_string(),
        count: 1,
    });
}

fn console_diff(capture: &CaptureStore, since: u64, errors_only: bool) -> (ConsoleDiff, u64) {
    let snapshot = capture.logs();
    let mut diff = ConsoleDiff::default();
    let (mut err_idx, mut warn_idx) = (HashMap::new(), HashMap::new());
    for entry in new_entries(&snapshot, since) {
        diff.total_new += 1;
        match entry.level.as_str() {
            "error" => add_console_entry(&mut diff.errors, &mut err_idx, &entry.message, &entry.source),
            "warn" | "warning" if !errors_only => {
                add_console_entry(&mut diff.warnings, &mut warn_idx, &entry.message, &entry.source)
            }
            _ => {}
        }
    }
    diff.errors.truncate(MAX_DIFF_ENTRIES);
    diff.warnings.truncate(MAX_DIFF_ENTRIES);
    (diff, snapshot.total_added)
}

fn classify_body(diff: &mut NetworkDiff, body: &NetworkBody, known: &HashMap<String, EndpointState>) {
    let path = url_path(&body.url);
    let prev = known.get(&path);
    let mut note_new = |diff: &mut NetworkDiff| {
        if !diff.new_endpoints.contains(&path) {
            diff.new_endpoints.push(path.clone());
        }
    };

    if body.status >= 400 {
        match prev {
            Some(p) if p.status < 400 => diff.failures.push(NetworkFailure {
                path: path.clone(),
                status: body.status,
                previous_status: p.status,
            }),
            Some(_) => {}
            None => note_new(diff),
        }
        return;
    }

    if prev.is_none() {
        note_new(diff);
    }
    if let Some(p) = prev {
        if body.duration > 0 && p.duration > 0 && body.duration > p.duration * DEGRADED_LATENCY_FACTOR {
            diff.degraded.push(NetworkDegraded {
                path: path.clone(),
                duration_ms: body.duration,
                baseline_ms: p.duration,
            });
        }
    }
}

fn network_diff(
    capture: &CaptureStore,
    since: u64,
    known: &HashMap<String, EndpointState>,
) -> (NetworkDiff, BufferSnapshot<NetworkBody>) {
    let snapshot = capture.network_bodies();
    let mut diff = NetworkDiff::default();
    for body in new_entries(&snapshot, since) {
        diff.total_new += 1;
        classify_body(&mut diff, body, known);
    }
    diff.failures.truncate(MAX_DIFF_ENTRIES);
    diff.new_endpoints.truncate(MAX_DIFF_ENTRIES);
    diff.degraded.truncate(MAX_DIFF_ENTRIES);
    (diff, snapshot)
}

fn classify_ws_event(diff: &mut WebSocketDiff, evt: &WebSocketEvent, errors_only: bool) {
    match evt.event.as_str() {
        "close" if !errors_only => diff.disconnections.push(WsDisconnection {
            url: evt.url.clone(),
            close_code: evt.code,
            close_reason: evt.reason.clone(),
        }),
        "open" => diff.connections.push(WsConnection {
            url: evt.url.clone(),
            id: evt.id.clone(),
        }),
        "error" => diff.errors.push(WsError {
            url: evt.url.clone(),
            message: evt.data.clone(),
        }),
        _ => {}
    }
}

fn websocket_diff(capture: &CaptureStore, since: u64, errors_only: bool) -> (WebSocketDiff, u64) {
    let snapshot = capture.websocket_events();
    let mut diff = WebSocketDiff::default();
    for evt in new_entries(&snapshot, since) {
        diff.total_new += 1;
        classify_ws_event(&mut diff, evt, errors_only);
    }
    diff.connections.truncate(MAX_DIFF_ENTRIES);
    diff.disconnections.truncate(MAX_DIFF_ENTRIES);
    diff.errors.truncate(MAX_DIFF_ENTRIES);
    (diff, snapshot.total_added)
}

fn actions_diff(capture: &CaptureStore, since: u64) -> (ActionsDiff, u64) {
    let snapshot = capture.actions();
    let mut diff = ActionsDiff::default();
    for action in new_entries(&snapshot, since) {
        diff.total_new += 1;
        if diff.actions.len() < MAX_DIFF_ENTRIES {
            diff.actions.push(ActionEntry {
                action_type: action.action_type.clone(),
                url: action.url.clone(),
                timestamp: action.timestamp,
            });
        }
    }
    (diff, snapshot.total_added)
}

fn severity_of(resp: &DiffResponse) -> &'static str {
    let console_errors = resp.console.as_ref().is_some_and(|c| !c.errors.is_empty());
    let network_failures = resp.network.as_ref().is_some_and(|n| !n.failures.is_empty());
    let console_warnings = resp.console.as_ref().is_some_and(|c| !c.warnings.is_empty());
    let ws_disconnects = resp.websocket.as_ref().is_some_and(|w| !w.disconnections.is_empty());
    if console_errors || network_failures {
        "error"
    } else if console_warnings || ws_disconnects {
        "warning"
    } else {
        "clean"
    }
}

fn summary_of(resp: &DiffResponse) -> String {
    if resp.severity == "clean" {
        return "No significant changes.".to_string();
    }
    let mut parts = Vec::new();
    if let Some(c) = &resp.console {
        if !c.errors.is_empty() {
            parts.push(format!("{} new console error(s)", c.errors.iter().map(|e| e.count).sum::<usize>()));
        }
    }
    if let Some(n) = &resp.network {
        if !n.failures.is_empty() {
            parts.push(format!("{} network failure(s)", n.failures.len()));
        }
    }
    if let Some(c) = &resp.console {
        if !c.warnings.is_empty() {
            parts.push(format!("{} new console warning(s)", c.warnings.iter().map(|e| e.count).sum::<usize>()));
        }
    }
    if let Some(w) = &resp.websocket {
        if !w.disconnections.is_empty() {
            parts.push(format!("{} websocket disconnection(s)", w.disconnections.len()));
        }
    }
    if parts.is_empty() {
        "No significant changes.".to_string()
    } else {
        parts.join(", ")
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

// ─── Manager ─────────────────────────────────────────────────────────────────

struct CheckpointState {
    auto: Option<Checkpoint>,
    named: HashMap<String, Checkpoint>,
    named_order: VecDeque<String>,
}

pub struct CheckpointManager {
    started_at: DateTime<Utc>,
    state: Mutex<CheckpointState>,
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            state: Mutex::new(CheckpointState {
                auto: None,
                named: HashMap::new(),
                named_order: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a named checkpoint at the current buffer positions, replacing
    /// any checkpoint of the same name.
    pub fn create(&self, name: &str, capture: &CaptureStore, alerts: &AlertTracker) -> Result<Checkpoint> {
        if name.is_empty() {
            return Err(Error::MissingParam("name".to_string()));
        }
        if name.chars().count() > MAX_CHECKPOINT_NAME_LEN {
            return Err(Error::invalid_param(
                "name",
                format!("checkpoint name exceeds {} characters", MAX_CHECKPOINT_NAME_LEN),
            ));
        }
        let bodies = capture.network_bodies();
        let checkpoint = Checkpoint {
            name: name.to_string(),
            created_at: Utc::now(),
            positions: capture.positions(),
            alert_delivery: alerts.delivery_counter(),
            known_endpoints: known_endpoints(&HashMap::new(), &bodies.entries),
        };

        let mut st = self.lock();
        if st.named.contains_key(name) {
            st.named_order.retain(|n| n != name);
        } else {
            while st.named_order.len() >= MAX_NAMED_CHECKPOINTS {
                if let Some(oldest) = st.named_order.pop_front() {
                    st.named.remove(&oldest);
                    debug!(name = %oldest, "Evicted oldest checkpoint");
                }
            }
        }
        st.named_order.push_back(name.to_string());
        st.named.insert(name.to_string(), checkpoint.clone());
        info!(name, "Checkpoint created");
        Ok(checkpoint)
    }

    pub fn names(&self) -> Vec<(String, DateTime<Utc>)> {
        let st = self.lock();
        st.named_order
            .iter()
            .filter_map(|n| st.named.get(n).map(|c| (n.clone(), c.created_at)))
            .collect()
    }

    pub fn clear(&self) {
        let mut st = self.lock();
        st.auto = None;
        st.named.clear();
        st.named_order.clear();
    }

    /// Diff since the requested checkpoint. Unnamed requests advance the auto
    /// checkpoint and mark the returned alerts delivered.
    pub fn changes_since(&self, req: &DiffRequest, capture: &CaptureStore, alerts: &AlertTracker) -> Result<DiffResponse> {
        for cat in &req.include {
            if !DIFF_CATEGORIES.contains(&cat.as_str()) {
                return Err(Error::invalid_param(
                    "include",
                    format!("unknown category '{}'; expected one of {}", cat, DIFF_CATEGORIES.join(", ")),
                ));
            }
        }
        let wants = |cat: &str| req.include.is_empty() || req.include.iter().any(|c| c == cat);
        let is_auto = req.checkpoint.is_empty();

        let mut st = self.lock();
        let cp = if is_auto {
            st.auto.clone().unwrap_or_else(|| Checkpoint::beginning(self.started_at))
        } else if let Some(named) = st.named.get(&req.checkpoint) {
            named.clone()
        } else if let Some(t) = parse_timestamp(&req.checkpoint) {
            let positions = capture.positions_at(t);
            let earlier = capture.network_bodies();
            let seen = earlier
                .sequenced()
                .take_while(|(seq, _, _)| *seq <= positions.network)
                .map(|(_, _, body)| body);
            Checkpoint {
                name: req.checkpoint.clone(),
                created_at: t,
                known_endpoints: known_endpoints(&HashMap::new(), seen),
                positions,
                alert_delivery: 0,
            }
        } else {
            debug!(checkpoint = %req.checkpoint, "Unknown checkpoint, diffing from the beginning");
            Checkpoint::beginning(self.started_at)
        };

        let now = Utc::now();
        let (console, logs_pos) = console_diff(capture, cp.positions.logs, req.errors_only);
        let (network, bodies) = network_diff(capture, cp.positions.network, &cp.known_endpoints);
        let (websocket, ws_pos) = websocket_diff(capture, cp.positions.websocket, req.errors_only);
        let (actions, actions_pos) = actions_diff(capture, cp.positions.actions);

        let console = Some(console).filter(|c| {
            wants("console") && if req.errors_only { !c.errors.is_empty() } else { c.total_new > 0 }
        });
        let network = Some(network).filter(|n| {
            wants("network") && !(n.failures.is_empty() && n.new_endpoints.is_empty() && n.degraded.is_empty())
        });
        let websocket = Some(websocket).filter(|w| {
            let has_errors = !w.errors.is_empty();
            let has_any = has_errors || !w.connections.is_empty() || !w.disconnections.is_empty();
            wants("websocket") && has_any && (!req.errors_only || has_errors)
        });
        let actions = Some(actions).filter(|a| wants("actions") && !a.actions.is_empty());

        let mut resp = DiffResponse {
            from: cp.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            to: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms: (now - cp.created_at).num_milliseconds(),
            severity: String::new(),
            summary: String::new(),
            token_count: 0,
            console,
            network,
            websocket,
            actions,
            performance_alerts: alerts.pending_alerts(cp.alert_delivery),
        };
        resp.severity = severity_of(&resp).to_string();
        resp.summary = summary_of(&resp);
        resp.token_count = serde_json::to_string(&resp).map(|s| s.len() / 4).unwrap_or(0);

        if is_auto {
            alerts.mark_delivered();
            st.auto = Some(Checkpoint {
                name: String::new(),
                created_at: now,
                positions: BufferPositions {
                    logs: logs_pos,
                    network: bodies.total_added,
                    websocket: ws_pos,
                    actions: actions_pos,
                },
                alert_delivery: alerts.delivery_counter(),
                known_endpoints: known_endpoints(&cp.known_endpoints, &bodies.entries),
            });
        }
        Ok(resp)
    }
}

fn known_endpoints<'a>(
    existing: &HashMap<String, EndpointState>,
    bodies: impl IntoIterator<Item = &'a NetworkBody>,
) -> HashMap<String, EndpointState> {
    let mut out = existing.clone();
    for body in bodies {
        out.insert(
            url_path(&body.url),
            EndpointState {
                status: body.status,
                duration: body.duration,
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabscope_core::types::{LogEntry, PerformanceBaseline, PerformanceSnapshot, PerformanceTiming};
    use tabscope_core::Config;

    fn setup() -> (CheckpointManager, CaptureStore, AlertTracker) {
        (CheckpointManager::new(), CaptureStore::new(&Config::default()), AlertTracker::new())
    }

    fn log(level: &str, msg: &str) -> LogEntry {
        LogEntry {
            level: level.into(),
            message: msg.into(),
            source: "app.js".into(),
            ..Default::default()
        }
    }

    fn body(url: &str, status: i64, duration: i64) -> NetworkBody {
        NetworkBody {
            method: "GET".into(),
            url: url.into(),
            status,
            duration,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_auto_query_sees_everything_then_advances() {
        let (mgr, cap, alerts) = setup();
        cap.add_logs(vec![log("error", "Request 12345 failed"), log("error", "Request 67890 failed")]);
        let resp = mgr.changes_since(&DiffRequest::default(), &cap, &alerts).unwrap();
        let console = resp.console.unwrap();
        assert_eq!(console.errors.len(), 1);
        assert_eq!(console.errors[0].count, 2);
        assert_eq!(resp.severity, "error");
        assert_eq!(resp.summary, "2 new console error(s)");

        let again = mgr.changes_since(&DiffRequest::default(), &cap, &alerts).unwrap();
        assert!(again.console.is_none());
        assert_eq!(again.severity, "clean");
        assert_eq!(again.summary, "No significant changes.");
    }

    #[test]
    fn test_named_checkpoint_does_not_advance() {
        let (mgr, cap, alerts) = setup();
        cap.add_logs(vec![log("warn", "old")]);
        mgr.create("before", &cap, &alerts).unwrap();
        cap.add_logs(vec![log("warn", "deprecated API")]);
        let req = DiffRequest {
            checkpoint: "before".into(),
            ..Default::default()
        };
        for _ in 0..2 {
            let resp = mgr.changes_since(&req, &cap, &alerts).unwrap();
            let warnings = resp.console.unwrap().warnings;
            assert_eq!(warnings.len(), 1);
            assert_eq!(warnings[0].message, "deprecated API");
            assert_eq!(resp.severity, "warning");
        }
    }

    #[test]
    fn test_errors_only_filters() {
        let (mgr, cap, alerts) = setup();
        cap.add_logs(vec![log("warn", "w")]);
        cap.add_websocket_events(vec![WebSocketEvent {
            event: "close".into(),
            url: "wss://x".into(),
            code: 1006,
            ..Default::default()
        }]);
        let req = DiffRequest {
            errors_only: true,
            ..Default::default()
        };
        let resp = mgr.changes_since(&req, &cap, &alerts).unwrap();
        assert!(resp.console.is_none());
        assert!(resp.websocket.is_none());
        assert_eq!(resp.severity, "clean");
    }

    #[test]
    fn test_network_classification() {
        let (mgr, cap, alerts) = setup();
        cap.add_network_bodies(vec![body("https://a.test/api/users?page=1", 200, 100)]);
        mgr.changes_since(&DiffRequest::default(), &cap, &alerts).unwrap();

        cap.add_network_bodies(vec![
            body("https://a.test/api/users", 500, 50),
            body("https://a.test/api/new", 200, 20),
        ]);
        let resp = mgr.changes_since(&DiffRequest::default(), &cap, &alerts).unwrap();
        let net = resp.network.unwrap();
        assert_eq!(
            net.failures,
            vec![NetworkFailure { path: "/api/users".into(), status: 500, previous_status: 200 }]
        );
        assert_eq!(net.new_endpoints, vec!["/api/new".to_string()]);
        assert_eq!(resp.summary, "1 network failure(s)");
    }

    #[test]
    fn test_degraded_endpoint() {
        let (mgr, cap, alerts) = setup();
        cap.add_network_bodies(vec![body("/api/slow", 200, 100)]);
        mgr.changes_since(&DiffRequest::default(), &cap, &alerts).unwrap();
        cap.add_network_bodies(vec![body("/api/slow", 200, 400)]);
        let net = mgr
            .changes_since(&DiffRequest::default(), &cap, &alerts)
            .unwrap()
            .network
            .unwrap();
        assert_eq!(net.degraded[0].baseline_ms, 100);
        assert_eq!(net.degraded[0].duration_ms, 400);
    }

    #[test]
    fn test_timestamp_checkpoint() {
        let (mgr, cap, alerts) = setup();
        cap.add_logs(vec![log("error", "before")]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cap.add_logs(vec![log("error", "after")]);
        let req = DiffRequest {
            checkpoint: t.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ..Default::default()
        };
        let resp = mgr.changes_since(&req, &cap, &alerts).unwrap();
        let errors = resp.console.unwrap().errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "after");
    }

    #[test]
    fn test_timestamp_checkpoint_knows_earlier_endpoints() {
        let (mgr, cap, alerts) = setup();
        cap.add_network_bodies(vec![body("https://a.test/api/users", 200, 100)]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cap.add_network_bodies(vec![
            body("https://a.test/api/users", 200, 110),
            body("https://a.test/api/orders", 200, 20),
        ]);
        let req = DiffRequest {
            checkpoint: t.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ..Default::default()
        };
        let net = mgr.changes_since(&req, &cap, &alerts).unwrap().network.unwrap();
        assert_eq!(net.new_endpoints, vec!["/api/orders".to_string()]);
    }

    #[test]
    fn test_info_logs_still_reported() {
        let (mgr, cap, alerts) = setup();
        cap.add_logs(vec![log("info", "page loaded"), log("log", "hydrated")]);
        let resp = mgr.changes_since(&DiffRequest::default(), &cap, &alerts).unwrap();
        let console = resp.console.unwrap();
        assert_eq!(console.total_new, 2);
        assert!(console.errors.is_empty() && console.warnings.is_empty());
        assert_eq!(resp.severity, "clean");
    }

    #[test]
    fn test_include_validation_and_filter() {
        let (mgr, cap, alerts) = setup();
        let bad = DiffRequest {
            include: vec!["dom".into()],
            ..Default::default()
        };
        assert!(matches!(
            mgr.changes_since(&bad, &cap, &alerts),
            Err(Error::InvalidParam { ref param, .. }) if param == "include"
        ));

        cap.add_logs(vec![log("error", "x")]);
        let only_net = DiffRequest {
            include: vec!["network".into()],
            ..Default::default()
        };
        assert!(mgr.changes_since(&only_net, &cap, &alerts).unwrap().console.is_none());
    }

    #[test]
    fn test_checkpoint_name_limits() {
        let (mgr, cap, alerts) = setup();
        assert!(mgr.create("", &cap, &alerts).is_err());
        assert!(mgr.create(&"x".repeat(51), &cap, &alerts).is_err());
        for i in 0..(MAX_NAMED_CHECKPOINTS + 1) {
            mgr.create(&format!("cp{}", i), &cap, &alerts).unwrap();
        }
        let names = mgr.names();
        assert_eq!(names.len(), MAX_NAMED_CHECKPOINTS);
        assert_eq!(names[0].0, "cp1");
    }

    #[test]
    fn test_alerts_delivered_once_per_auto_poller() {
        let (mgr, cap, alerts) = setup();
        let base = PerformanceBaseline {
            url: "/".into(),
            sample_count: 1,
            timing: PerformanceTiming { load: 1000.0, ..Default::default() },
            ..Default::default()
        };
        let snap = PerformanceSnapshot {
            url: "/".into(),
            timing: PerformanceTiming { load: 3000.0, ..Default::default() },
            ..Default::default()
        };
        alerts.observe_snapshot(&snap, Some(&base));

        let first = mgr.changes_since(&DiffRequest::default(), &cap, &alerts).unwrap();
        assert_eq!(first.performance_alerts.len(), 1);
        let second = mgr.changes_since(&DiffRequest::default(), &cap, &alerts).unwrap();
        assert!(second.performance_alerts.is_empty());
    }

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("https://a.test/api/x?y=1"), "/api/x");
        assert_eq!(url_path("/relative/path?q"), "/relative/path");
    }
}
