//! `observe`: read-only views over what the extension has captured.

mod buffers;
mod extension;
mod views;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tabscope_core::{Error, Result};
use tabscope_storage::CaptureStore;
use tracing::debug;

use crate::args;
use crate::response::{attach_metadata, ResponseMetadata};
use crate::{Tool, ToolContext, ToolOutput, ToolSchema};

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

pub const MODES: [&str; 22] = [
    "errors",
    "logs",
    "extension_logs",
    "network_waterfall",
    "network_bodies",
    "websocket_events",
    "websocket_status",
    "actions",
    "vitals",
    "page",
    "tabs",
    "timeline",
    "error_bundles",
    "summarized_logs",
    "changes",
    "performance_alerts",
    "storage",
    "indexeddb",
    "screenshot",
    "command_result",
    "pending_commands",
    "failed_commands",
];

pub struct ObserveTool;

#[async_trait]
impl Tool for ObserveTool {
    fn schema(&self) -> ToolSchema {
        let mut props = serde_json::Map::new();
        props.insert("what".into(), json!({"type": "string", "enum": MODES, "description": "Which view to read"}));
        props.insert("limit".into(), json!({"type": "integer", "description": "Max entries to return. Default: 100, max: 1000"}));
        props.insert("url".into(), json!({"type": "string", "description": "Case-insensitive URL substring filter"}));
        props.insert("level".into(), json!({"type": "string", "description": "(logs/summarized_logs/extension_logs) Exact level"}));
        props.insert("min_level".into(), json!({"type": "string", "enum": ["debug", "log", "info", "warn", "error"], "description": "(logs/summarized_logs) Minimum severity"}));
        props.insert("source".into(), json!({"type": "string", "description": "(logs/summarized_logs) Exact source filter"}));
        props.insert("scope".into(), json!({"type": "string", "enum": ["current_page", "all"], "description": "(errors/logs/summarized_logs) Tracked tab only, or every tab. Default: current_page"}));
        props.insert("after_cursor".into(), json!({"type": "string", "description": "(errors/logs/network_bodies/websocket_events/actions) Entries newer than this cursor"}));
        props.insert("before_cursor".into(), json!({"type": "string", "description": "(errors/logs/network_bodies/websocket_events/actions) Entries older than this cursor"}));
        props.insert("since_cursor".into(), json!({"type": "string", "description": "(errors/logs/network_bodies/websocket_events/actions) Every entry from this cursor on"}));
        props.insert("restart_on_eviction".into(), json!({"type": "boolean", "description": "(paginated views) Restart from the oldest entry instead of failing on an evicted cursor"}));
        props.insert("method".into(), json!({"type": "string", "description": "(network_bodies) HTTP method filter"}));
        props.insert("status_min".into(), json!({"type": "integer", "description": "(network_bodies) Minimum status"}));
        props.insert("status_max".into(), json!({"type": "integer", "description": "(network_bodies) Maximum status"}));
        props.insert("body_key".into(), json!({"type": "string", "description": "(network_bodies) Keep bodies whose JSON has this key anywhere; returns its values"}));
        props.insert("body_path".into(), json!({"type": "string", "description": "(network_bodies) Extract a JSON path such as data.items[0].id"}));
        props.insert("connection_id".into(), json!({"type": "string", "description": "(websocket_events/websocket_status) Connection id"}));
        props.insert("direction".into(), json!({"type": "string", "enum": ["incoming", "outgoing"], "description": "(websocket_events) Message direction"}));
        props.insert("include".into(), json!({"type": "array", "items": {"type": "string"}, "description": "(timeline) actions|errors|network|websocket; (changes) console|network|websocket|actions"}));
        props.insert("checkpoint".into(), json!({"type": "string", "description": "(changes) Named checkpoint or RFC3339 timestamp. Omit to diff since your last call"}));
        props.insert("severity".into(), json!({"type": "string", "enum": ["all", "errors_only"], "description": "(changes) Default: all"}));
        props.insert("window_seconds".into(), json!({"type": "integer", "description": "(error_bundles) Context window before each error, 1-10. Default: 3"}));
        props.insert("min_group_size".into(), json!({"type": "integer", "description": "(summarized_logs) Minimum repeats to form a group. Default: 2"}));
        props.insert("storage_type".into(), json!({"type": "string", "enum": ["local", "session", "cookies", "all"], "description": "(storage) Which storage to read. Default: all"}));
        props.insert("database".into(), json!({"type": "string", "description": "(indexeddb) Database name; omit to list databases"}));
        props.insert("store".into(), json!({"type": "string", "description": "(indexeddb) Object store to read entries from"}));
        props.insert("format".into(), json!({"type": "string", "enum": ["png", "jpeg"], "description": "(screenshot) Image format"}));
        props.insert("quality".into(), json!({"type": "integer", "description": "(screenshot) JPEG quality 1-100"}));
        props.insert("full_page".into(), json!({"type": "boolean", "description": "(screenshot) Capture the whole page"}));
        props.insert("selector".into(), json!({"type": "string", "description": "(screenshot) Capture one element"}));
        props.insert("correlation_id".into(), json!({"type": "string", "description": "(command_result) Id returned by a background interact call"}));

        ToolSchema {
            name: "observe",
            description: "Read browser telemetry captured by the extension: console errors and logs, network waterfall and bodies, WebSocket traffic, user actions, web vitals, page and tab info, a merged timeline, error bundles with surrounding context, compressed log summaries, changes since a checkpoint, performance regressions, storage, IndexedDB, screenshots and async command results.",
            parameters: json!({
                "type": "object",
                "properties": Value::Object(props),
                "required": ["what"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let what = args::require_str(params, "what")?;
        if !MODES.contains(&what) {
            return Err(Error::UnknownMode(format!(
                "Unknown observe mode '{}'. Valid: {}",
                what,
                MODES.join(", ")
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolOutput> {
        let what = args::require_str(&params, "what")?;
        debug!(what, "observe execute");

        match what {
            "errors" => buffers::errors(&ctx, &params),
            "logs" => buffers::logs(&ctx, &params),
            "extension_logs" => buffers::extension_logs(&ctx, &params),
            "network_waterfall" => buffers::network_waterfall(&ctx, &params).await,
            "network_bodies" => buffers::network_bodies(&ctx, &params),
            "websocket_events" => buffers::websocket_events(&ctx, &params),
            "websocket_status" => buffers::websocket_status(&ctx, &params),
            "actions" => buffers::actions(&ctx, &params),
            "vitals" => views::vitals(&ctx),
            "page" => views::page(&ctx),
            "tabs" => views::tabs(&ctx),
            "timeline" => views::timeline(&ctx, &params),
            "error_bundles" => views::error_bundles(&ctx, &params),
            "summarized_logs" => views::summarized_logs(&ctx, &params),
            "changes" => views::changes(&ctx, &params),
            "performance_alerts" => views::performance_alerts(&ctx),
            "storage" => extension::storage(&ctx, &params).await,
            "indexeddb" => extension::indexeddb(&ctx, &params).await,
            "screenshot" => extension::screenshot(&ctx, &params).await,
            "command_result" => extension::command_result(&ctx, &params).await,
            "pending_commands" => extension::pending_commands(&ctx),
            "failed_commands" => extension::failed_commands(&ctx),
            other => Err(Error::UnknownMode(format!("Unknown observe mode '{}'", other))),
        }
    }
}

// ─── Shared helpers ──────────────────────────────────────────────────────────

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

/// Tab the extension is tracking, if tracking is on.
pub(crate) fn tracked_tab(capture: &CaptureStore) -> Option<i64> {
    let tracking = capture.tracking();
    tracking.tab_id.filter(|_| tracking.enabled)
}

/// Builds the tool output with freshness metadata merged into `data`.
pub(crate) fn buffer_output(
    ctx: &ToolContext,
    summary: &str,
    mut data: Value,
    newest: Option<DateTime<Utc>>,
) -> Result<ToolOutput> {
    attach_metadata(&mut data, &ResponseMetadata::new(&ctx.capture, newest));
    Ok(ToolOutput::new(summary, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabscope_core::Config;

    #[test]
    fn test_validate_modes() {
        let tool = ObserveTool;
        assert!(tool.validate(&json!({"what": "errors"})).is_ok());
        assert!(matches!(tool.validate(&json!({"what": "pilot"})), Err(Error::UnknownMode(_))));
        assert!(matches!(tool.validate(&json!({})), Err(Error::MissingParam(_))));
    }

    #[test]
    fn test_schema_lists_every_mode() {
        let schema = ObserveTool.schema();
        let modes = schema.parameters["properties"]["what"]["enum"].as_array().unwrap().len();
        assert_eq!(modes, MODES.len());
    }

    #[tokio::test]
    async fn test_every_local_mode_answers_on_empty_store() {
        let ctx = ToolContext::new(Config::default());
        let local = MODES
            .iter()
            .filter(|m| !matches!(**m, "storage" | "indexeddb" | "screenshot" | "command_result"));
        for what in local {
            let out = ObserveTool.execute(ctx.clone(), json!({"what": what})).await;
            let out = out.unwrap_or_else(|e| panic!("{} failed: {}", what, e));
            assert!(!out.summary.is_empty(), "{}", what);
        }
    }
}
