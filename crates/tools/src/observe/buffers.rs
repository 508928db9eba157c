//! Views that read one capture buffer each. Console, body, WebSocket and
//! action reads are cursor-paginated, oldest to newest within a page.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use tabscope_core::types::{
    level_rank, EnhancedAction, LogEntry, NetworkBody, NetworkWaterfallEntry, NetworkWaterfallPayload, WebSocketEvent,
};
use tabscope_core::{Error, Result};
use tabscope_storage::{filter_scope, paginate, BufferSnapshot, Page, PageRequest, TelemetryKind};

use super::{buffer_output, parse_ts, tracked_tab, DEFAULT_LIMIT, MAX_LIMIT};
use crate::args::{self, contains_ignore_case};
use crate::pending::QueryType;
use crate::summarize::{is_console_noise, LogScope};
use crate::{ToolContext, ToolOutput};

const WATERFALL_FRESH_FOR: Duration = Duration::from_secs(1);
const WATERFALL_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

fn log_view(e: &LogEntry) -> Value {
    json!({
        "level": e.level,
        "message": e.message,
        "source": e.source,
        "url": e.url,
        "line": e.line,
        "column": e.column,
        "timestamp": e.ts,
        "tab_id": e.tab_id,
    })
}

fn scope_admits(scope: LogScope, tracked: Option<i64>, entry: &LogEntry) -> bool {
    match (scope, tracked) {
        (LogScope::CurrentPage, Some(tab)) => entry.tab_id == Some(tab),
        _ => true,
    }
}

// ─── Paging ──────────────────────────────────────────────────────────────────

fn page_request(params: &Value, scope: String) -> PageRequest {
    PageRequest {
        after_cursor: args::opt_string(params, "after_cursor"),
        before_cursor: args::opt_string(params, "before_cursor"),
        since_cursor: args::opt_string(params, "since_cursor"),
        limit: args::limit(params, DEFAULT_LIMIT, MAX_LIMIT),
        restart_on_eviction: args::bool_or(params, "restart_on_eviction", false),
        scope,
    }
}

/// Pages the entries `select` keeps. Each is stamped with its own time, or
/// with when the daemon stored it when the entry carries none.
fn page_of<'a, T, U>(
    snapshot: &'a BufferSnapshot<T>,
    req: &PageRequest,
    stamp: impl Fn(&T) -> Option<DateTime<Utc>>,
    mut select: impl FnMut(&'a T) -> Option<U>,
) -> Result<Page<U>> {
    let mut filtered = Vec::new();
    for (seq, added_at, entry) in snapshot.sequenced() {
        if let Some(item) = select(entry) {
            let at = stamp(entry).unwrap_or(added_at);
            filtered.push((seq, at.to_rfc3339_opts(SecondsFormat::Millis, true), item));
        }
    }
    paginate(filtered, snapshot.oldest_sequence(), req)
}

/// Newest matching entry, for freshness metadata.
fn page_newest<U>(page: &Page<U>) -> Option<DateTime<Utc>> {
    page.metadata.newest_timestamp.as_deref().and_then(parse_ts)
}

fn page_metadata<U>(page: &Page<U>) -> Result<Value> {
    Ok(serde_json::to_value(&page.metadata)?)
}

fn action_stamp(a: &EnhancedAction) -> Option<DateTime<Utc>> {
    if a.timestamp > 0 {
        DateTime::<Utc>::from_timestamp_millis(a.timestamp)
    } else {
        None
    }
}

// ─── Console ─────────────────────────────────────────────────────────────────

pub(super) fn errors(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let scope = LogScope::parse(args::opt_str(params, "scope"))?;
    let url = args::opt_str(params, "url").unwrap_or("");
    let tracked = tracked_tab(&ctx.capture);
    let req = page_request(
        params,
        filter_scope(&[("view", "errors"), ("url", url), ("scope", scope_name(scope))]),
    );

    let snapshot = ctx.capture.logs();
    let mut noise_suppressed = 0;
    let page = page_of(&snapshot, &req, |e| parse_ts(&e.ts), |entry| {
        if entry.level != "error" {
            return None;
        }
        if is_console_noise(entry) {
            noise_suppressed += 1;
            return None;
        }
        (scope_admits(scope, tracked, entry) && contains_ignore_case(&entry.url, url)).then_some(entry)
    })?;

    let errors: Vec<Value> = page
        .items
        .iter()
        .map(|entry| {
            json!({
                "message": entry.message,
                "source": entry.source,
                "url": entry.url,
                "line": entry.line,
                "column": entry.column,
                "stack": entry.stack,
                "timestamp": entry.ts,
                "tab_id": entry.tab_id,
            })
        })
        .collect();
    let mut meta = page_metadata(&page)?;
    meta["scope"] = json!(scope_name(scope));
    meta["noise_suppressed"] = json!(noise_suppressed);
    let data = json!({ "errors": errors, "count": errors.len(), "metadata": meta });
    buffer_output(ctx, "Browser errors", data, page_newest(&page))
}

fn scope_name(scope: LogScope) -> &'static str {
    match scope {
        LogScope::CurrentPage => "current_page",
        LogScope::All => "all",
    }
}

/// Console logs with cursor pagination. Cursors are scoped to the filters.
pub(super) fn logs(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let scope = LogScope::parse(args::opt_str(params, "scope"))?;
    let level = args::opt_str(params, "level").unwrap_or("");
    let min_level = args::opt_str(params, "min_level").unwrap_or("");
    let source = args::opt_str(params, "source").unwrap_or("");
    let url = args::opt_str(params, "url").unwrap_or("");
    let tracked = tracked_tab(&ctx.capture);
    let req = page_request(
        params,
        filter_scope(&[
            ("level", level),
            ("min_level", min_level),
            ("source", source),
            ("url", url),
            ("scope", scope_name(scope)),
        ]),
    );

    let snapshot = ctx.capture.logs();
    let mut noise_suppressed = 0;
    let page = page_of(&snapshot, &req, |e| parse_ts(&e.ts), |entry| {
        if entry.is_internal() {
            return None;
        }
        if is_console_noise(entry) {
            noise_suppressed += 1;
            return None;
        }
        let admitted = scope_admits(scope, tracked, entry)
            && (level.is_empty() || entry.level == level)
            && (min_level.is_empty() || level_rank(&entry.level) >= level_rank(min_level))
            && (source.is_empty() || entry.source == source)
            && contains_ignore_case(&entry.url, url);
        admitted.then_some(entry)
    })?;
    let logs: Vec<Value> = page.items.iter().map(|e| log_view(e)).collect();

    let mut meta = page_metadata(&page)?;
    meta["scope"] = json!(scope_name(scope));
    if noise_suppressed > 0 {
        meta["noise_suppressed"] = json!(noise_suppressed);
    }
    let data = json!({ "logs": logs, "count": logs.len(), "metadata": meta });
    buffer_output(ctx, "Browser logs", data, page_newest(&page))
}

pub(super) fn extension_logs(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let limit = args::limit(params, DEFAULT_LIMIT, MAX_LIMIT);
    let level = args::opt_str(params, "level");
    let snapshot = ctx.capture.extension_logs();
    let logs: Vec<_> = snapshot
        .entries
        .iter()
        .rev()
        .filter(|e| level.map_or(true, |l| e.level == l))
        .take(limit)
        .collect();
    let newest = snapshot.entries.last().map(|e| e.timestamp);
    let data = json!({ "logs": logs, "count": logs.len() });
    buffer_output(ctx, "Extension logs", data, newest)
}

// ─── Network ─────────────────────────────────────────────────────────────────

/// Asks the extension for a fresh waterfall when the buffered one is old.
/// Falls back to what is buffered on any failure.
async fn refresh_waterfall(ctx: &ToolContext) {
    let fresh = ctx
        .capture
        .newest_added_at(TelemetryKind::Waterfall)
        .and_then(|t| (Utc::now() - t).to_std().ok())
        .is_some_and(|age| age < WATERFALL_FRESH_FOR);
    if fresh || !ctx.capture.extension_connected() {
        return;
    }
    let answer = ctx
        .queries
        .query(QueryType::Waterfall, json!({}), tracked_tab(&ctx.capture), WATERFALL_QUERY_TIMEOUT)
        .await;
    match answer.and_then(|v| Ok(serde_json::from_value::<NetworkWaterfallPayload>(v)?)) {
        Ok(payload) if !payload.entries.is_empty() => {
            ctx.capture.add_waterfall(payload.entries, &payload.page_url);
        }
        Ok(_) => {}
        Err(e) => debug!(error = %e, "Waterfall refresh failed, serving buffered entries"),
    }
}

fn waterfall_view(e: &NetworkWaterfallEntry) -> Value {
    json!({
        "url": e.url,
        "initiator_type": e.initiator_type,
        "duration_ms": e.duration,
        "start_time": e.start_time,
        "transfer_size": e.transfer_size,
        "decoded_body_size": e.decoded_body_size,
        "encoded_body_size": e.encoded_body_size,
        "timestamp": e.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        "page_url": e.page_url,
    })
}

pub(super) async fn network_waterfall(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let limit = args::limit(params, DEFAULT_LIMIT, MAX_LIMIT);
    let url = args::opt_str(params, "url").unwrap_or("");
    refresh_waterfall(ctx).await;

    let snapshot = ctx.capture.waterfall();
    let entries: Vec<Value> = snapshot
        .entries
        .iter()
        .rev()
        .filter(|e| url.is_empty() || (!e.url.is_empty() && contains_ignore_case(&e.url, url)))
        .take(limit)
        .map(waterfall_view)
        .collect();
    let newest = snapshot.entries.last().map(|e| e.timestamp);
    let data = json!({ "entries": entries, "count": entries.len() });
    buffer_output(ctx, "Network waterfall", data, newest)
}

#[derive(Debug, Clone, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parses `data.items[0].id` style paths.
fn parse_body_path(path: &str) -> Result<Vec<PathSegment>> {
    let invalid = |why: &str| Error::invalid_param("body_path", format!("Invalid body_path '{}': {}", path, why));
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if name.is_empty() && rest.is_empty() {
            return Err(invalid("empty segment"));
        }
        if !name.is_empty() {
            segments.push(PathSegment::Key(name.to_string()));
        }
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
            let index = rest[1..close]
                .parse::<usize>()
                .map_err(|_| invalid("array index must be a non-negative integer"))?;
            segments.push(PathSegment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid("unexpected text after ']'"));
            }
        }
    }
    Ok(segments)
}

fn extract_path<'a>(value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, seg| match seg {
        PathSegment::Key(k) => v.get(k.as_str()),
        PathSegment::Index(i) => v.get(*i),
    })
}

fn collect_key<'a>(value: &'a Value, key: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if k == key {
                    out.push(v);
                }
                collect_key(v, key, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_key(v, key, out)),
        _ => {}
    }
}

enum BodyFilter {
    None,
    Key(String),
    Path(Vec<PathSegment>),
}

impl BodyFilter {
    /// The body narrowed to the requested part, or `None` to drop it.
    fn apply(&self, mut body: NetworkBody) -> Option<NetworkBody> {
        if let BodyFilter::None = self {
            return Some(body);
        }
        let parsed: Value = serde_json::from_str(&body.response_body).ok()?;
        let narrowed = match self {
            BodyFilter::Key(key) => {
                let mut found = Vec::new();
                collect_key(&parsed, key, &mut found);
                match found.len() {
                    0 => return None,
                    1 => found[0].clone(),
                    _ => Value::Array(found.into_iter().cloned().collect()),
                }
            }
            BodyFilter::Path(path) => extract_path(&parsed, path)?.clone(),
            BodyFilter::None => return Some(body),
        };
        body.response_body = narrowed.to_string();
        Some(body)
    }
}

pub(super) fn network_bodies(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let filter = match (args::opt_str(params, "body_key"), args::opt_str(params, "body_path")) {
        (Some(_), Some(_)) => {
            return Err(Error::invalid_param(
                "body_key",
                "Only one body filter can be used at a time; use either 'body_key' or 'body_path'",
            ))
        }
        (Some(key), None) => BodyFilter::Key(key.to_string()),
        (None, Some(path)) => BodyFilter::Path(parse_body_path(path)?),
        (None, None) => BodyFilter::None,
    };
    let url = args::opt_str(params, "url").unwrap_or("");
    let method = args::opt_str(params, "method").unwrap_or("");
    let status_min = args::opt_i64(params, "status_min").filter(|s| *s > 0);
    let status_max = args::opt_i64(params, "status_max").filter(|s| *s > 0);
    let status_bounds = format!("{:?}..{:?}", status_min, status_max);
    let req = page_request(
        params,
        filter_scope(&[
            ("view", "network_bodies"),
            ("url", url),
            ("method", method),
            ("status", status_bounds.as_str()),
            ("body_key", args::opt_str(params, "body_key").unwrap_or("")),
            ("body_path", args::opt_str(params, "body_path").unwrap_or("")),
        ]),
    );

    let snapshot = ctx.capture.network_bodies();
    let page = page_of(&snapshot, &req, |b| parse_ts(&b.ts), |b| {
        let admitted = contains_ignore_case(&b.url, url)
            && contains_ignore_case(&b.method, method)
            && status_min.map_or(true, |m| b.status >= m)
            && status_max.map_or(true, |m| b.status <= m);
        if admitted {
            filter.apply(b.clone())
        } else {
            None
        }
    })?;
    let meta = page_metadata(&page)?;
    let newest = page_newest(&page);
    let data = json!({ "entries": page.items, "count": page.metadata.count, "metadata": meta });
    buffer_output(ctx, "Network bodies", data, newest)
}

// ─── WebSocket ───────────────────────────────────────────────────────────────

pub(super) fn websocket_events(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let url = args::opt_str(params, "url").unwrap_or("");
    let connection_id = args::opt_str(params, "connection_id").unwrap_or("");
    let direction = args::opt_str(params, "direction").unwrap_or("");
    let req = page_request(
        params,
        filter_scope(&[
            ("view", "websocket_events"),
            ("url", url),
            ("connection_id", connection_id),
            ("direction", direction),
        ]),
    );

    let snapshot = ctx.capture.websocket_events();
    let page = page_of(&snapshot, &req, |e| parse_ts(&e.ts), |e| {
        let admitted = contains_ignore_case(&e.url, url)
            && (connection_id.is_empty() || e.id == connection_id)
            && (direction.is_empty() || e.direction == direction);
        admitted.then_some(e)
    })?;
    let meta = page_metadata(&page)?;
    let newest = page_newest(&page);
    let data = json!({ "entries": page.items, "count": page.metadata.count, "metadata": meta });
    buffer_output(ctx, "WebSocket events", data, newest)
}

#[derive(Debug, Clone, Serialize)]
struct ActiveConnection {
    id: String,
    url: String,
    opened_at: String,
    incoming: u64,
    outgoing: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    last_message_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    last_error: String,
}

#[derive(Debug, Clone, Serialize)]
struct ClosedConnection {
    id: String,
    url: String,
    close_code: i64,
    close_reason: String,
    closed_at: String,
}

/// Replays the buffered events into open and closed connection lists.
pub(super) fn websocket_status(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let url = args::opt_str(params, "url").unwrap_or("");
    let connection_id = args::opt_str(params, "connection_id");

    let mut active: Vec<ActiveConnection> = Vec::new();
    let mut closed: Vec<ClosedConnection> = Vec::new();
    let snapshot = ctx.capture.websocket_events();
    let relevant = snapshot
        .entries
        .iter()
        .filter(|e| contains_ignore_case(&e.url, url))
        .filter(|e| connection_id.map_or(true, |id| e.id == id));
    for evt in relevant {
        let pos = active.iter().position(|c| c.id == evt.id);
        match (evt.event.as_str(), pos) {
            ("open", _) => {
                if let Some(i) = pos {
                    active.remove(i);
                }
                active.push(ActiveConnection {
                    id: evt.id.clone(),
                    url: evt.url.clone(),
                    opened_at: evt.ts.clone(),
                    incoming: 0,
                    outgoing: 0,
                    last_message_at: String::new(),
                    last_error: String::new(),
                });
            }
            ("message", Some(i)) => {
                let conn = &mut active[i];
                if evt.direction == "outgoing" {
                    conn.outgoing += 1;
                } else {
                    conn.incoming += 1;
                }
                conn.last_message_at = evt.ts.clone();
            }
            ("error", Some(i)) => active[i].last_error = evt.data.clone(),
            ("close", _) => {
                if let Some(i) = pos {
                    active.remove(i);
                }
                closed.push(ClosedConnection {
                    id: evt.id.clone(),
                    url: evt.url.clone(),
                    close_code: evt.code,
                    close_reason: evt.reason.clone(),
                    closed_at: evt.ts.clone(),
                });
            }
            _ => {}
        }
    }

    let data = json!({
        "connections": active,
        "closed": closed,
        "active_count": active.len(),
        "closed_count": closed.len(),
    });
    buffer_output(ctx, "WebSocket status", data, Some(Utc::now()))
}

// ─── Actions ─────────────────────────────────────────────────────────────────

pub(super) fn actions(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let url = args::opt_str(params, "url").unwrap_or("");
    let req = page_request(params, filter_scope(&[("view", "actions"), ("url", url)]));

    let snapshot = ctx.capture.actions();
    let page = page_of(&snapshot, &req, action_stamp, |a| {
        contains_ignore_case(&a.url, url).then_some(a)
    })?;
    let meta = page_metadata(&page)?;
    let newest = page_newest(&page);
    let data = json!({ "entries": page.items, "count": page.metadata.count, "metadata": meta });
    buffer_output(ctx, "Enhanced actions", data, newest)
}
