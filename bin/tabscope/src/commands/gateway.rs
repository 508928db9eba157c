//! HTTP endpoint the browser extension posts telemetry to and polls for queries.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use tabscope_core::types::{
    EnhancedAction, ExtensionLog, LogEntry, NetworkBody, NetworkWaterfallPayload, PerformanceSnapshot,
    WebSocketEvent,
};
use tabscope_storage::capture::BufferStat;
use tabscope_storage::TrackingStatus;
use tabscope_tools::pending::PendingQuery;
use tabscope_tools::ToolContext;

/// Extension posts can carry large response bodies.
const MAX_POST_BODY: usize = 10 * 1024 * 1024;
const POLL_IDLE_MS: u64 = 1000;
const POLL_BUSY_MS: u64 = 200;

// ─── Payloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LogsBatch {
    #[serde(default)]
    entries: Vec<LogEntry>,
}

#[derive(Debug, Deserialize)]
struct ExtensionLogsBatch {
    #[serde(default)]
    logs: Vec<ExtensionLog>,
}

#[derive(Debug, Deserialize)]
struct BodiesBatch {
    #[serde(default)]
    bodies: Vec<NetworkBody>,
}

#[derive(Debug, Deserialize)]
struct EventsBatch {
    #[serde(default)]
    events: Vec<WebSocketEvent>,
}

#[derive(Debug, Deserialize)]
struct ActionsBatch {
    #[serde(default)]
    actions: Vec<EnhancedAction>,
}

#[derive(Debug, Deserialize)]
struct SnapshotsBatch {
    #[serde(default)]
    snapshots: Vec<PerformanceSnapshot>,
}

#[derive(Debug, Deserialize)]
struct QueryResultRequest {
    id: String,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncSettings {
    #[serde(default)]
    tracking_enabled: bool,
    #[serde(default)]
    tracked_tab_id: Option<i64>,
    #[serde(default)]
    tracked_tab_url: String,
    #[serde(default)]
    tracked_tab_title: String,
}

#[derive(Debug, Deserialize)]
struct SyncCommandResult {
    #[serde(default)]
    id: String,
    #[serde(default)]
    correlation_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    extension_version: String,
    #[serde(default)]
    settings: Option<SyncSettings>,
    #[serde(default)]
    extension_logs: Vec<ExtensionLog>,
    #[serde(default)]
    command_results: Vec<SyncCommandResult>,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    ack: bool,
    commands: Vec<PendingQuery>,
    next_poll_ms: u64,
    server_time: String,
    server_version: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    extension_connected: bool,
    buffers: BTreeMap<&'static str, BufferStat>,
    pending_queries: usize,
}

fn received(n: usize) -> Json<Value> {
    Json(json!({ "received": n }))
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn handle_health(State(ctx): State<ToolContext>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: ctx.started_at.elapsed().as_secs(),
        extension_connected: ctx.capture.extension_connected(),
        buffers: ctx.capture.stats(),
        pending_queries: ctx.queries.pending_count(),
    })
}

async fn handle_logs(State(ctx): State<ToolContext>, Json(batch): Json<LogsBatch>) -> impl IntoResponse {
    received(ctx.capture.add_logs(batch.entries))
}

async fn handle_extension_logs(
    State(ctx): State<ToolContext>,
    Json(batch): Json<ExtensionLogsBatch>,
) -> impl IntoResponse {
    received(ctx.capture.add_extension_logs(batch.logs))
}

async fn handle_network_bodies(State(ctx): State<ToolContext>, Json(batch): Json<BodiesBatch>) -> impl IntoResponse {
    received(ctx.capture.add_network_bodies(batch.bodies))
}

async fn handle_waterfall(
    State(ctx): State<ToolContext>,
    Json(payload): Json<NetworkWaterfallPayload>,
) -> impl IntoResponse {
    received(ctx.capture.add_waterfall(payload.entries, &payload.page_url))
}

async fn handle_websocket_events(State(ctx): State<ToolContext>, Json(batch): Json<EventsBatch>) -> impl IntoResponse {
    received(ctx.capture.add_websocket_events(batch.events))
}

async fn handle_actions(State(ctx): State<ToolContext>, Json(batch): Json<ActionsBatch>) -> impl IntoResponse {
    received(ctx.capture.add_actions(batch.actions))
}

/// Each snapshot is checked against the baseline it is about to update.
async fn handle_performance(State(ctx): State<ToolContext>, Json(batch): Json<SnapshotsBatch>) -> impl IntoResponse {
    let n = batch.snapshots.len();
    let mut alerts = 0;
    for snapshot in batch.snapshots {
        let baseline = ctx.capture.add_performance_snapshot(snapshot.clone());
        if ctx.alerts.observe_snapshot(&snapshot, baseline.as_ref()).is_some() {
            alerts += 1;
        }
    }
    Json(json!({ "received": n, "alerts": alerts }))
}

async fn handle_query_result(
    State(ctx): State<ToolContext>,
    Json(req): Json<QueryResultRequest>,
) -> impl IntoResponse {
    let outcome = match req.error.filter(|e| !e.is_empty()) {
        Some(e) => Err(e),
        None => Ok(req.result),
    };
    if ctx.queries.resolve(&req.id, outcome) {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        debug!(id = %req.id, "Result for unknown or expired query");
        (StatusCode::NOT_FOUND, Json(json!({ "status": "unknown_query" })))
    }
}

async fn handle_sync(State(ctx): State<ToolContext>, Json(req): Json<SyncRequest>) -> impl IntoResponse {
    ctx.capture.record_sync(&req.session_id, &req.extension_version);

    if let Some(settings) = req.settings {
        ctx.capture.set_tracking(TrackingStatus {
            enabled: settings.tracking_enabled,
            tab_id: settings.tracked_tab_id,
            tab_url: settings.tracked_tab_url,
            tab_title: settings.tracked_tab_title,
        });
    }
    if !req.extension_logs.is_empty() {
        ctx.capture.add_extension_logs(req.extension_logs);
    }

    for result in req.command_results {
        let error = result.error.filter(|e| !e.is_empty());
        if !result.id.is_empty() {
            let outcome = match &error {
                Some(e) => Err(e.clone()),
                None => Ok(result.result.clone().unwrap_or(Value::Null)),
            };
            ctx.queries.resolve(&result.id, outcome);
        }
        // An explicit status from the extension is authoritative over the resolve above.
        if !result.correlation_id.is_empty() && !result.status.is_empty() {
            ctx.queries
                .complete_command(&result.correlation_id, &result.status, result.result, error);
        }
    }

    let commands = ctx.queries.take_undelivered();
    let next_poll_ms = if commands.is_empty() { POLL_IDLE_MS } else { POLL_BUSY_MS };
    Json(SyncResponse {
        ack: true,
        commands,
        next_poll_ms,
        server_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        server_version: env!("CARGO_PKG_VERSION"),
    })
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub fn router(ctx: ToolContext) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/logs", post(handle_logs))
        .route("/extension-logs", post(handle_extension_logs))
        .route("/network-bodies", post(handle_network_bodies))
        .route("/network-waterfall", post(handle_waterfall))
        .route("/websocket-events", post(handle_websocket_events))
        .route("/enhanced-actions", post(handle_actions))
        .route("/performance-snapshots", post(handle_performance))
        .route("/query-result", post(handle_query_result))
        .route("/sync", post(handle_sync))
        .layer(DefaultBodyLimit::max(MAX_POST_BODY))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive().allow_credentials(false))
        .with_state(ctx)
}

/// Serves until `shutdown` resolves. Binds loopback only.
pub async fn serve(
    ctx: ToolContext,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        warn!(%addr, error = %e, "Failed to bind extension endpoint");
        e
    })?;
    info!(%addr, "Extension endpoint listening");
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Extension endpoint stopped");
    Ok(())
}
