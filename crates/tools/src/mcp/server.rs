//! JSON-RPC dispatch for the MCP stdio channel.

use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mcp::protocol::*;
use crate::mcp::timeout::request_timeout;
use crate::response::{error_result, json_result};
use crate::{ToolContext, ToolRegistry};

pub const SERVER_NAME: &str = "tabscope";
pub const GUIDE_URI: &str = "tabscope://guide";

const GUIDE: &str = r#"# tabscope

tabscope serves what the browser extension captures in the tracked tab.

## Tools

- `observe`: read telemetry. Start with `what="errors"` or `what="logs"`.
  `what="changes"` returns only what happened since your previous call, and
  `what="error_bundles"` pairs each error with the requests, actions and logs
  that preceded it.
- `analyze`: `performance` compares page loads with their baselines; `dom`
  and `accessibility` run inside the page.
- `interact`: run JavaScript, navigate, click or type. Pass
  `background=true` for slow commands and poll
  `observe(what="command_result", correlation_id=...)`.
- `configure`: save a named checkpoint, clear buffers, check health.

## Paging

`errors`, `logs`, `network_bodies`, `websocket_events` and `actions` return
`metadata.cursor` along with `total` and `has_more`. Pass the cursor back as
`after_cursor` to read only newer entries, `before_cursor` to scroll back, or
`since_cursor` for everything from it on. A cursor only works with the same
filters that produced it. If the buffer has evicted past it, set
`restart_on_eviction=true` to start again from the oldest entry.
"#;

/// Dispatches decoded MCP requests to the tool registry.
pub struct McpServer {
    registry: ToolRegistry,
    ctx: ToolContext,
}

impl McpServer {
    pub fn new(ctx: ToolContext) -> Self {
        Self {
            registry: ToolRegistry::with_defaults(),
            ctx,
        }
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Handles one raw message. Notifications produce no response.
    pub async fn dispatch(&self, raw: &str) -> Option<JsonRpcResponse> {
        let req: JsonRpcRequest = match serde_json::from_str(raw) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "Unparseable MCP message");
                return Some(JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {}", e)));
            }
        };
        if !req.jsonrpc.is_empty() && req.jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::failure(
                req.id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                format!("Unsupported jsonrpc version '{}'", req.jsonrpc),
            ));
        }

        let deadline = request_timeout(&req.method, req.params.as_ref());
        self.dispatch_with_deadline(req, deadline).await
    }

    async fn dispatch_with_deadline(&self, req: JsonRpcRequest, deadline: Duration) -> Option<JsonRpcResponse> {
        let notification = req.is_notification();
        let id = req.id.clone().unwrap_or(Value::Null);
        let method = req.method.clone();
        debug!(method = %method, notification, "MCP ← request");

        let outcome = tokio::time::timeout(deadline, self.handle(req)).await;
        if notification {
            return None;
        }
        Some(match outcome {
            Ok(Ok(result)) => JsonRpcResponse::success(id, result),
            Ok(Err((code, message))) => JsonRpcResponse::failure(id, code, message),
            Err(_) => {
                warn!(method = %method, secs = deadline.as_secs(), "MCP request timed out");
                JsonRpcResponse::failure(
                    id,
                    INTERNAL_ERROR,
                    format!("request timed out after {}s", deadline.as_secs()),
                )
            }
        })
    }

    async fn handle(&self, req: JsonRpcRequest) -> Result<Value, (i64, String)> {
        match McpMethod::parse(&req.method) {
            McpMethod::Initialize => {
                info!("MCP client initialized");
                Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": { "tools": {}, "resources": {} },
                }))
            }
            McpMethod::Initialized | McpMethod::Ping => Ok(json!({})),
            McpMethod::ToolsList => Ok(json!({ "tools": self.registry.mcp_tool_list() })),
            McpMethod::ToolsCall => self.call_tool(req.params).await,
            McpMethod::ResourcesList => Ok(json!({
                "resources": [{
                    "uri": GUIDE_URI,
                    "name": "tabscope guide",
                    "description": "How to use the tabscope tools",
                    "mimeType": "text/markdown",
                }]
            })),
            McpMethod::ResourcesRead => {
                let params: ResourceReadParams = parse_params(req.params)?;
                if params.uri != GUIDE_URI {
                    return Err((INVALID_PARAMS, format!("Unknown resource: {}", params.uri)));
                }
                Ok(json!({
                    "contents": [{ "uri": GUIDE_URI, "mimeType": "text/markdown", "text": GUIDE }]
                }))
            }
            McpMethod::ResourcesTemplatesList => Ok(json!({ "resourceTemplates": [] })),
            McpMethod::PromptsList => Ok(json!({ "prompts": [] })),
            McpMethod::Unknown(m) => Err((METHOD_NOT_FOUND, format!("Method not found: {}", m))),
        }
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, (i64, String)> {
        let call: ToolCallParams = parse_params(params)?;
        if self.registry.get(&call.name).is_none() {
            return Err((INVALID_PARAMS, format!("Unknown tool: {}", call.name)));
        }
        let arguments = if call.arguments.is_null() { json!({}) } else { call.arguments };

        let result = match self.registry.execute(&call.name, self.ctx.clone(), arguments).await {
            Ok(output) => {
                let mut result = json_result(&output.summary, &output.data);
                if let Some(image) = output.image {
                    result.content.push(ContentBlock::Image {
                        data: image.data,
                        mime_type: image.mime_type,
                    });
                }
                result
            }
            Err(e) => {
                debug!(tool = %call.name, error = %e, "Tool call failed");
                error_result(&e)
            }
        };
        serde_json::to_value(result).map_err(|e| (INTERNAL_ERROR, e.to_string()))
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, (i64, String)> {
    let params = params.ok_or_else(|| (INVALID_PARAMS, "Missing params".to_string()))?;
    serde_json::from_value(params).map_err(|e| (INVALID_PARAMS, format!("Invalid params: {}", e)))
}
