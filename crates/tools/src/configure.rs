use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use tabscope_core::{Error, Result};
use tabscope_storage::TelemetryKind;

use crate::args;
use crate::{Tool, ToolContext, ToolOutput, ToolSchema};

pub const CONFIGURE_ACTIONS: [&str; 4] = ["checkpoint", "clear", "health", "capture"];

/// Session housekeeping: named checkpoints, clearing buffers, and daemon
/// health and capture reports.
pub struct ConfigureTool;

#[async_trait]
impl Tool for ConfigureTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "configure",
            description: "Manage the capture session. 'checkpoint' saves a named point for observe(what=\"changes\"). 'clear' empties one buffer or all. 'health' reports daemon and extension status. 'capture' reports buffer fill, memory pressure and tracking.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": CONFIGURE_ACTIONS,
                        "description": "What to do"
                    },
                    "name": {
                        "type": "string",
                        "description": "(checkpoint) Checkpoint name, at most 50 characters"
                    },
                    "buffer": {
                        "type": "string",
                        "description": "(clear) logs, extension_logs, network_waterfall, network_bodies, websocket_events, actions, performance or all. Default: all"
                    }
                },
                "required": ["action"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let action = args::one_of(params, "action", &CONFIGURE_ACTIONS)?;
        match action {
            "checkpoint" => {
                args::require_str(params, "name")?;
            }
            "clear" => {
                clear_targets(args::opt_str(params, "buffer").unwrap_or("all"))?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolOutput> {
        match args::one_of(&params, "action", &CONFIGURE_ACTIONS)? {
            "checkpoint" => {
                let name = args::require_str(&params, "name")?;
                let cp = ctx.checkpoints.create(name, &ctx.capture, &ctx.alerts)?;
                let data = json!({
                    "name": cp.name,
                    "created_at": cp.created_at.to_rfc3339(),
                    "positions": cp.positions,
                    "checkpoints": ctx.checkpoints.names().into_iter().map(|(n, _)| n).collect::<Vec<_>>(),
                });
                Ok(ToolOutput::new(format!("Checkpoint '{}' saved", name), data))
            }
            "clear" => clear(&ctx, args::opt_str(&params, "buffer").unwrap_or("all")),
            "health" => Ok(ToolOutput::new("Daemon health", health(&ctx))),
            "capture" => Ok(ToolOutput::new("Capture report", capture_report(&ctx))),
            other => Err(Error::UnknownMode(format!("Unknown configure action '{}'", other))),
        }
    }
}

fn clear_targets(buffer: &str) -> Result<Vec<TelemetryKind>> {
    if buffer == "all" {
        return Ok(TelemetryKind::ALL.to_vec());
    }
    TelemetryKind::parse(buffer).map(|k| vec![k]).ok_or_else(|| {
        Error::invalid_param(
            "buffer",
            format!(
                "Unknown buffer '{}'. Valid: all, {}",
                buffer,
                TelemetryKind::ALL.map(TelemetryKind::as_str).join(", ")
            ),
        )
    })
}

fn clear(ctx: &ToolContext, buffer: &str) -> Result<ToolOutput> {
    let mut cleared = Map::new();
    let mut total = 0;
    for kind in clear_targets(buffer)? {
        let n = ctx.capture.clear(kind);
        total += n;
        cleared.insert(kind.as_str().to_string(), json!(n));
    }
    if buffer == "all" {
        cleared.insert("performance_alerts".into(), json!(ctx.alerts.clear()));
        ctx.checkpoints.clear();
    }
    info!(buffer, total, "Buffers cleared");
    let data = json!({ "cleared": cleared, "total": total });
    Ok(ToolOutput::new(format!("Cleared {} entries", total), data))
}

fn health(ctx: &ToolContext) -> Value {
    let tracking = ctx.capture.tracking();
    json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "extension": {
            "connected": ctx.capture.extension_connected(),
            "version": ctx.capture.extension_version(),
            "last_sync_age_secs": ctx.capture.last_sync_age().map(|d| d.as_secs_f64()),
        },
        "tracking": tracking,
        "buffers": ctx.capture.stats(),
        "memory_pressure": ctx.capture.pressure().as_str(),
        "pending_queries": ctx.queries.pending_count(),
        "pending_commands": ctx.queries.pending_commands().len(),
        "checkpoints": ctx.checkpoints.names().len(),
    })
}

fn capture_report(ctx: &ToolContext) -> Value {
    let pressure = ctx.capture.pressure();
    json!({
        "buffers": ctx.capture.stats(),
        "memory": {
            "pressure": pressure.as_str(),
            "estimated_bytes": ctx.capture.estimated_bytes(),
            "soft_limit_bytes": ctx.config.memory.soft_limit_bytes,
            "hard_limit_bytes": ctx.config.memory.hard_limit_bytes,
            "network_bodies_enabled": pressure.network_bodies_enabled(),
        },
        "tracking": ctx.capture.tracking(),
        "extension_connected": ctx.capture.extension_connected(),
    })
}
