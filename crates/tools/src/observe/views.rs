//! Derived views: page state, vitals, the merged timeline, error bundles,
//! log summaries and checkpoint diffs.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Value};

use tabscope_core::types::LogEntry;
use tabscope_core::Result;
use tabscope_storage::TelemetryKind;

use super::{buffer_output, parse_ts};
use crate::args;
use crate::checkpoint::DiffRequest;
use crate::summarize::{is_console_noise, summarize_logs, SummaryRequest};
use crate::{safe_truncate, ToolContext, ToolOutput};

const TIMELINE_DEFAULT_LIMIT: usize = 50;
const TIMELINE_MAX_LIMIT: usize = 200;
const TIMELINE_KINDS: [&str; 4] = ["actions", "errors", "network", "websocket"];
const BUNDLE_DEFAULT_LIMIT: usize = 5;
const BUNDLE_MAX_LIMIT: usize = 50;
const BUNDLE_DEFAULT_WINDOW: i64 = 3;
const BUNDLE_MAX_WINDOW: i64 = 10;
/// Cap on entries per context category in one bundle.
const BUNDLE_CONTEXT_CAP: usize = 20;

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Entry timestamp, falling back to when the daemon stored it.
fn stamp_or(ts: &str, added_at: DateTime<Utc>) -> DateTime<Utc> {
    parse_ts(ts).unwrap_or(added_at)
}

// ─── Page state ──────────────────────────────────────────────────────────────

pub(super) fn vitals(ctx: &ToolContext) -> Result<ToolOutput> {
    let latest = ctx.capture.with_performance(|p| p.latest_snapshot().cloned());
    let data = match &latest {
        Some(snap) => {
            let mut v = json!({
                "has_data": true,
                "url": snap.url,
                "timestamp": snap.timestamp,
                "domContentLoaded": snap.timing.dom_content_loaded,
                "load": snap.timing.load,
            });
            if let Some(lcp) = snap.timing.largest_contentful_paint {
                v["lcp"] = json!(lcp);
            }
            if let Some(fcp) = snap.timing.first_contentful_paint {
                v["fcp"] = json!(fcp);
            }
            if let Some(inp) = snap.timing.interaction_to_next_paint {
                v["inp"] = json!(inp);
            }
            if let Some(cls) = snap.cls {
                v["cls"] = json!(cls);
            }
            v
        }
        None => json!({ "has_data": false }),
    };
    let newest = latest.as_ref().and_then(|s| parse_ts(&s.timestamp));
    buffer_output(ctx, "Web vitals", data, newest)
}

pub(super) fn page(ctx: &ToolContext) -> Result<ToolOutput> {
    let tracking = ctx.capture.tracking();
    let mut url = tracking.tab_url.clone();
    if url.is_empty() {
        url = ctx
            .capture
            .waterfall()
            .entries
            .iter()
            .rev()
            .find(|e| !e.page_url.is_empty())
            .map(|e| e.page_url.clone())
            .unwrap_or_default();
    }
    let mut title = tracking.tab_title.clone();
    if title.is_empty() {
        title = ctx
            .capture
            .logs()
            .entries
            .iter()
            .rev()
            .find(|e| !e.title.is_empty())
            .map(|e| e.title.clone())
            .unwrap_or_default();
    }
    let data = json!({
        "url": url,
        "title": title,
        "tracked": tracking.enabled,
        "tab_id": tracking.tab_id,
    });
    buffer_output(ctx, "Page info", data, ctx.capture.last_sync_at())
}

pub(super) fn tabs(ctx: &ToolContext) -> Result<ToolOutput> {
    let tracking = ctx.capture.tracking();
    let tabs: Vec<Value> = match tracking.tab_id.filter(|_| tracking.enabled) {
        Some(id) => vec![json!({
            "id": id,
            "url": tracking.tab_url,
            "title": tracking.tab_title,
            "tracked": true,
            "active": true,
        })],
        None => Vec::new(),
    };
    let data = json!({ "tabs": tabs, "tracking_active": tracking.enabled });
    buffer_output(ctx, "Browser tabs", data, ctx.capture.last_sync_at())
}

pub(super) fn performance_alerts(ctx: &ToolContext) -> Result<ToolOutput> {
    let alerts = ctx.alerts.all();
    let data = json!({ "alerts": alerts, "count": alerts.len() });
    let newest = alerts.last().and_then(|a| parse_ts(&a.detected_at));
    buffer_output(ctx, "Performance alerts", data, newest)
}

// ─── Timeline ────────────────────────────────────────────────────────────────

fn action_target(selectors: Option<&Value>) -> Option<String> {
    let sel = selectors?;
    ["cssPath", "css", "id", "testId"]
        .iter()
        .find_map(|k| sel.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn error_summary(message: &str) -> String {
    if message.len() > 80 {
        format!("{}...", safe_truncate(message, 80))
    } else {
        message.to_string()
    }
}

pub(super) fn timeline(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let limit = args::limit(params, TIMELINE_DEFAULT_LIMIT, TIMELINE_MAX_LIMIT);
    let mut include = args::string_list(params, "include");
    include.retain(|k| TIMELINE_KINDS.contains(&k.as_str()));
    let wants = |kind: &str| include.is_empty() || include.iter().any(|k| k == kind);

    let mut entries: Vec<(DateTime<Utc>, Value)> = Vec::new();
    let mut push = |at: DateTime<Utc>, kind: &str, summary: String| {
        entries.push((at, json!({ "timestamp": rfc3339(at), "type": kind, "summary": summary })));
    };

    if wants("actions") {
        let snap = ctx.capture.actions();
        for (_, added_at, a) in snap.sequenced() {
            let at = DateTime::<Utc>::from_timestamp_millis(a.timestamp).unwrap_or(added_at);
            let summary = match action_target(a.selectors.as_ref()) {
                Some(target) => format!("{} on {}", a.action_type, target),
                None => a.action_type.clone(),
            };
            push(at, "action", summary);
        }
    }
    if wants("errors") {
        let snap = ctx.capture.logs();
        for (_, added_at, e) in snap.sequenced() {
            if e.level == "error" && !is_console_noise(e) {
                push(stamp_or(&e.ts, added_at), "error", error_summary(&e.message));
            }
        }
    }
    if wants("network") {
        let snap = ctx.capture.waterfall();
        for w in &snap.entries {
            push(w.timestamp, "network", format!("{} {}", w.initiator_type, w.url));
        }
    }
    if wants("websocket") {
        let snap = ctx.capture.websocket_events();
        for (_, added_at, w) in snap.sequenced() {
            let summary = if w.direction.is_empty() {
                w.event.clone()
            } else {
                format!("{} ({})", w.event, w.direction)
            };
            push(stamp_or(&w.ts, added_at), "websocket", summary);
        }
    }

    entries.sort_by(|a, b| b.0.cmp(&a.0));
    let newest = entries.first().map(|(t, _)| *t);
    let total = entries.len();
    let entries: Vec<Value> = entries.into_iter().take(limit).map(|(_, v)| v).collect();
    let data = json!({ "entries": entries, "count": entries.len(), "total": total });
    buffer_output(ctx, "Session timeline", data, newest)
}

// ─── Error bundles ───────────────────────────────────────────────────────────

fn in_window(t: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    t > start && t <= end
}

/// Each recent error with the network, action and log context that preceded it.
pub(super) fn error_bundles(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let limit = args::limit(params, BUNDLE_DEFAULT_LIMIT, BUNDLE_MAX_LIMIT);
    let window_secs = match args::opt_i64(params, "window_seconds") {
        Some(n) if n > 0 => n.min(BUNDLE_MAX_WINDOW),
        _ => BUNDLE_DEFAULT_WINDOW,
    };
    let window = Duration::seconds(window_secs);

    let logs = ctx.capture.logs();
    let bodies = ctx.capture.network_bodies();
    let waterfall = ctx.capture.waterfall();
    let actions = ctx.capture.actions();

    let errors: Vec<(DateTime<Utc>, &LogEntry)> = logs
        .sequenced()
        .rev()
        .filter(|(_, _, e)| e.level == "error" && !is_console_noise(e))
        .take(limit)
        .map(|(_, added_at, e)| (stamp_or(&e.ts, added_at), e))
        .collect();

    let mut bundles = Vec::with_capacity(errors.len());
    for (at, error) in &errors {
        let start = *at - window;
        let network: Vec<Value> = bodies
            .sequenced()
            .filter(|(_, added_at, b)| in_window(stamp_or(&b.ts, *added_at), start, *at))
            .take(BUNDLE_CONTEXT_CAP)
            .map(|(_, _, b)| json!({"method": b.method, "url": b.url, "status": b.status, "duration_ms": b.duration}))
            .collect();
        let resources: Vec<Value> = waterfall
            .entries
            .iter()
            .filter(|w| in_window(w.timestamp, start, *at))
            .take(BUNDLE_CONTEXT_CAP)
            .map(|w| json!({"url": w.url, "initiator_type": w.initiator_type, "duration_ms": w.duration}))
            .collect();
        let recent_actions: Vec<Value> = actions
            .sequenced()
            .filter(|(_, added_at, a)| {
                let t = DateTime::<Utc>::from_timestamp_millis(a.timestamp).unwrap_or(*added_at);
                in_window(t, start, *at)
            })
            .take(BUNDLE_CONTEXT_CAP)
            .map(|(_, _, a)| json!({"type": a.action_type, "url": a.url, "timestamp": a.timestamp}))
            .collect();
        let context_logs: Vec<Value> = logs
            .sequenced()
            .filter(|(_, added_at, e)| {
                e.level != "error" && !e.is_internal() && in_window(stamp_or(&e.ts, *added_at), start, *at)
            })
            .take(BUNDLE_CONTEXT_CAP)
            .map(|(_, _, e)| json!({"level": e.level, "message": e.message, "source": e.source}))
            .collect();

        bundles.push(json!({
            "error": {
                "message": error.message,
                "source": error.source,
                "url": error.url,
                "line": error.line,
                "column": error.column,
                "stack": error.stack,
                "timestamp": rfc3339(*at),
            },
            "network": network,
            "waterfall": resources,
            "actions": recent_actions,
            "logs": context_logs,
            "context_window_seconds": window_secs,
        }));
    }

    let newest = errors.first().map(|(t, _)| *t);
    let data = json!({ "bundles": bundles, "count": bundles.len() });
    buffer_output(ctx, "Error bundles", data, newest)
}

// ─── Summaries and diffs ─────────────────────────────────────────────────────

pub(super) fn summarized_logs(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let req = SummaryRequest::from_params(params)?;
    let data = summarize_logs(&ctx.capture, &req);
    let newest = ctx.capture.newest_added_at(TelemetryKind::Logs);
    buffer_output(ctx, "Log summary", data, newest)
}

pub(super) fn changes(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let errors_only = match args::opt_str(params, "severity") {
        None => false,
        Some(_) => args::one_of(params, "severity", &["all", "errors_only"])? == "errors_only",
    };
    let req = DiffRequest {
        checkpoint: args::opt_string(params, "checkpoint").unwrap_or_default(),
        include: args::string_list(params, "include"),
        errors_only,
    };
    let diff = ctx.checkpoints.changes_since(&req, &ctx.capture, &ctx.alerts)?;
    let summary = format!("Changes since {}", diff.from);
    let data = serde_json::to_value(&diff)?;
    buffer_output(ctx, &summary, data, Some(Utc::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabscope_core::types::{EnhancedAction, NetworkBody, PerformanceSnapshot, PerformanceTiming};
    use tabscope_core::Config;
    use tabscope_storage::TrackingStatus;

    fn ctx() -> ToolContext {
        ToolContext::new(Config::default())
    }

    fn at(secs: i64) -> String {
        format!("2024-05-01T10:00:{:02}.000Z", secs)
    }

    #[test]
    fn test_vitals_reports_latest_snapshot() {
        let ctx = ctx();
        assert_eq!(vitals(&ctx).unwrap().data["has_data"], false);
        ctx.capture.add_performance_snapshot(PerformanceSnapshot {
            url: "https://a.test/".into(),
            timestamp: at(1),
            timing: PerformanceTiming {
                dom_content_loaded: 300.0,
                load: 900.0,
                largest_contentful_paint: Some(1200.0),
                ..Default::default()
            },
            ..Default::default()
        });
        let data = vitals(&ctx).unwrap().data;
        assert_eq!(data["has_data"], true);
        assert_eq!(data["lcp"], 1200.0);
        assert!(data.get("fcp").is_none());
    }

    #[test]
    fn test_page_prefers_tracked_tab() {
        let ctx = ctx();
        ctx.capture.add_logs(vec![LogEntry {
            title: "From logs".into(),
            ..Default::default()
        }]);
        let data = page(&ctx).unwrap().data;
        assert_eq!(data["title"], "From logs");
        assert_eq!(data["tracked"], false);

        ctx.capture.set_tracking(TrackingStatus {
            enabled: true,
            tab_id: Some(9),
            tab_url: "https://a.test/app".into(),
            tab_title: "App".into(),
        });
        let data = page(&ctx).unwrap().data;
        assert_eq!(data["title"], "App");
        assert_eq!(data["tab_id"], 9);
        assert_eq!(tabs(&ctx).unwrap().data["tabs"][0]["id"], 9);
    }

    #[test]
    fn test_timeline_merges_and_sorts_descending() {
        let ctx = ctx();
        let t1 = parse_ts(&at(1)).unwrap().timestamp_millis();
        ctx.capture.add_actions(vec![EnhancedAction {
            action_type: "click".into(),
            timestamp: t1,
            selectors: Some(json!({"cssPath": "button.save"})),
            ..Default::default()
        }]);
        ctx.capture.add_logs(vec![LogEntry {
            level: "error".into(),
            message: "x".repeat(100),
            ts: at(2),
            ..Default::default()
        }]);
        let data = timeline(&ctx, &json!({})).unwrap().data;
        assert_eq!(data["count"], 2);
        assert_eq!(data["entries"][0]["type"], "error");
        assert!(data["entries"][0]["summary"].as_str().unwrap().ends_with("..."));
        assert_eq!(data["entries"][1]["summary"], "click on button.save");

        let only_actions = timeline(&ctx, &json!({"include": ["actions"]})).unwrap().data;
        assert_eq!(only_actions["count"], 1);
    }

    #[test]
    fn test_error_bundle_collects_preceding_context() {
        let ctx = ctx();
        ctx.capture.add_network_bodies(vec![
            NetworkBody {
                ts: at(1),
                method: "GET".into(),
                url: "https://a.test/too-early".into(),
                status: 200,
                ..Default::default()
            },
            NetworkBody {
                ts: at(8),
                method: "POST".into(),
                url: "https://a.test/api/save".into(),
                status: 500,
                ..Default::default()
            },
        ]);
        ctx.capture.add_logs(vec![
            LogEntry {
                level: "warn".into(),
                message: "retrying".into(),
                ts: at(9),
                ..Default::default()
            },
            LogEntry {
                level: "error".into(),
                message: "Save failed".into(),
                ts: at(10),
                ..Default::default()
            },
        ]);
        let data = error_bundles(&ctx, &json!({})).unwrap().data;
        assert_eq!(data["count"], 1);
        let bundle = &data["bundles"][0];
        assert_eq!(bundle["error"]["message"], "Save failed");
        assert_eq!(bundle["network"].as_array().unwrap().len(), 1);
        assert_eq!(bundle["network"][0]["status"], 500);
        assert_eq!(bundle["logs"][0]["message"], "retrying");
        assert_eq!(bundle["context_window_seconds"], 3);

        let wide = error_bundles(&ctx, &json!({"window_seconds": 60})).unwrap().data;
        assert_eq!(wide["bundles"][0]["context_window_seconds"], 10);
        assert_eq!(wide["bundles"][0]["network"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_changes_validates_severity() {
        let ctx = ctx();
        assert!(changes(&ctx, &json!({"severity": "loud"})).is_err());
        let first = changes(&ctx, &json!({})).unwrap();
        assert!(first.summary.starts_with("Changes since"));
        assert!(changes(&ctx, &json!({"severity": "errors_only"})).is_ok());
    }
}
