//! `interact`: drive the tracked page through the extension.
//!
//! Calls block until the extension answers unless `background` is set, in
//! which case the command is queued under an `ann_` correlation id and its
//! outcome is read later with `observe(what="command_result")`.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use tabscope_core::{Error, Result};

use crate::args;
use crate::mcp::timeout::ASYNC_CORRELATION_PREFIX;
use crate::observe::tracked_tab;
use crate::pending::QueryType;
use crate::{Tool, ToolContext, ToolOutput, ToolSchema};

pub const ACTIONS: [&str; 6] = ["execute_js", "navigate", "refresh", "click", "type", "state_capture"];

pub struct InteractTool;

/// Query kind and payload for one action. Validates action-specific params.
fn build_query(action: &str, params: &Value) -> Result<(QueryType, Value)> {
    let query = match action {
        "execute_js" => json!({"action": "execute_js", "script": args::require_str(params, "script")?}),
        "navigate" => {
            let raw = args::require_str(params, "url")?;
            let parsed = url::Url::parse(raw)
                .map_err(|e| Error::invalid_param("url", format!("Invalid url '{}': {}", raw, e)))?;
            if !matches!(parsed.scheme(), "http" | "https" | "file") {
                return Err(Error::invalid_param(
                    "url",
                    format!("Unsupported scheme '{}'; use http, https or file", parsed.scheme()),
                ));
            }
            json!({"action": "navigate", "url": parsed.as_str()})
        }
        "refresh" => json!({"action": "refresh"}),
        "click" => json!({"action": "click", "selector": args::require_str(params, "selector")?}),
        "type" => json!({
            "action": "type",
            "selector": args::require_str(params, "selector")?,
            "text": params.get("text").and_then(Value::as_str).ok_or_else(|| Error::MissingParam("text".to_string()))?,
            "clear": args::bool_or(params, "clear", false),
        }),
        "state_capture" => return Ok((QueryType::StateCapture, json!({"kind": "page_state"}))),
        other => {
            return Err(Error::UnknownMode(format!(
                "Unknown interact action '{}'. Valid: {}",
                other,
                ACTIONS.join(", ")
            )))
        }
    };
    Ok((QueryType::Execute, query))
}

#[async_trait]
impl Tool for InteractTool {
    fn schema(&self) -> ToolSchema {
        let mut props = serde_json::Map::new();
        props.insert("action".into(), json!({"type": "string", "enum": ACTIONS, "description": "What to do in the tracked tab"}));
        props.insert("script".into(), json!({"type": "string", "description": "(execute_js) JavaScript to evaluate; the value of the last expression is returned"}));
        props.insert("url".into(), json!({"type": "string", "description": "(navigate) Absolute URL to open"}));
        props.insert("selector".into(), json!({"type": "string", "description": "(click/type) CSS selector of the target element"}));
        props.insert("text".into(), json!({"type": "string", "description": "(type) Text to enter"}));
        props.insert("clear".into(), json!({"type": "boolean", "description": "(type) Clear the field first"}));
        props.insert("background".into(), json!({"type": "boolean", "description": "Queue the command and return a correlation_id instead of waiting. Read the outcome with observe(what=\"command_result\")"}));

        ToolSchema {
            name: "interact",
            description: "Act on the tracked browser tab: run JavaScript, navigate, refresh, click, type, or capture page state. Set background=true for long-running commands.",
            parameters: json!({
                "type": "object",
                "properties": Value::Object(props),
                "required": ["action"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let action = args::require_str(params, "action")?;
        build_query(action, params).map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolOutput> {
        let action = args::require_str(&params, "action")?;
        let (kind, query) = build_query(action, &params)?;
        let tab_id = tracked_tab(&ctx.capture);
        let timeout = ctx.config.queries.default_timeout();

        if args::bool_or(&params, "background", false) {
            let correlation_id = format!("{}{}", ASYNC_CORRELATION_PREFIX, Uuid::new_v4().simple());
            // The ticket is dropped: the outcome lands in the command ledger.
            let _ = ctx
                .queries
                .create(kind, query, tab_id, Some(correlation_id.clone()), timeout);
            info!(action, correlation_id = %correlation_id, "Queued background command");
            let data = json!({
                "status": "queued",
                "correlation_id": correlation_id,
                "hint": "Poll observe(what=\"command_result\", correlation_id=...) for the outcome",
            });
            return Ok(ToolOutput::new(format!("{} queued", action), data));
        }

        debug!(action, ?tab_id, "interact execute");
        let result = ctx.queries.query(kind, query, tab_id, timeout).await?;
        Ok(ToolOutput::new(format!("{} completed", action), json!({"action": action, "result": result})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tabscope_core::Config;

    #[test]
    fn test_validate_action_params() {
        let tool = InteractTool;
        assert!(tool.validate(&json!({"action": "refresh"})).is_ok());
        assert!(matches!(tool.validate(&json!({"action": "click"})), Err(Error::MissingParam(_))));
        assert!(matches!(
            tool.validate(&json!({"action": "type", "selector": "#q"})),
            Err(Error::MissingParam(ref p)) if p == "text"
        ));
        assert!(tool.validate(&json!({"action": "type", "selector": "#q", "text": ""})).is_ok());
        assert!(matches!(
            tool.validate(&json!({"action": "navigate", "url": "javascript:alert(1)"})),
            Err(Error::InvalidParam { .. })
        ));
        assert!(matches!(tool.validate(&json!({"action": "hover"})), Err(Error::UnknownMode(_))));
    }

    #[tokio::test]
    async fn test_background_command_completes_later() {
        let ctx = ToolContext::new(Config::default());
        let out = InteractTool
            .execute(ctx.clone(), json!({"action": "execute_js", "script": "1+1", "background": true}))
            .await
            .unwrap();
        assert_eq!(out.data["status"], "queued");
        let cid = out.data["correlation_id"].as_str().unwrap().to_string();
        assert!(cid.starts_with(ASYNC_CORRELATION_PREFIX));

        let delivered = ctx.queries.take_undelivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].correlation_id.as_deref(), Some(cid.as_str()));
        ctx.queries.resolve(&delivered[0].id, Ok(json!(2)));

        let record = ctx.queries.command(&cid).unwrap();
        assert_eq!(record.result, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_sync_command_surfaces_extension_error() {
        let ctx = ToolContext::new(Config::default());
        let queries = ctx.queries.clone();
        tokio::spawn(async move {
            loop {
                if let Some(q) = queries.take_undelivered().into_iter().next() {
                    queries.resolve(&q.id, Ok(json!({"error": "Refused by CSP"})));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let err = InteractTool
            .execute(ctx, json!({"action": "execute_js", "script": "eval('x')"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Extension(ref m) if m == "Refused by CSP"));
    }
}
