//! Per-request deadline policy, decided before dispatch.

use serde_json::Value;
use std::time::Duration;

pub const FAST_TIMEOUT: Duration = Duration::from_secs(10);
pub const SLOW_TIMEOUT: Duration = Duration::from_secs(35);
/// `observe` polling an async command blocks for up to a minute on the server side.
pub const BLOCKING_POLL_TIMEOUT: Duration = Duration::from_secs(65);

pub const ASYNC_CORRELATION_PREFIX: &str = "ann_";

/// Deadline for a request. Total: malformed or unexpected params fall back
/// to the fast deadline.
pub fn request_timeout(method: &str, params: Option<&Value>) -> Duration {
    if method != "tools/call" {
        return FAST_TIMEOUT;
    }
    let Some(params) = params else {
        return FAST_TIMEOUT;
    };
    let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let args = params.get("arguments");
    let arg = |key: &str| args.and_then(|a| a.get(key)).and_then(|v| v.as_str()).unwrap_or("");

    match name {
        "analyze" | "interact" => SLOW_TIMEOUT,
        "observe" => match arg("what") {
            "screenshot" => SLOW_TIMEOUT,
            "command_result" if arg("correlation_id").starts_with(ASYNC_CORRELATION_PREFIX) => BLOCKING_POLL_TIMEOUT,
            _ => FAST_TIMEOUT,
        },
        _ => FAST_TIMEOUT,
    }
}

/// Same as [`request_timeout`] but from the raw `params` JSON text.
pub fn request_timeout_raw(method: &str, raw_params: &str) -> Duration {
    let parsed: Option<Value> = serde_json::from_str(raw_params).ok();
    request_timeout(method, parsed.as_ref())
}

/// `(tool name, mode)` of a `tools/call` params blob, for logging. The mode is
/// the tool's `what` argument, or `action` when there is none. Malformed input
/// yields empty strings.
pub fn extract_tool_action(raw_params: &str) -> (String, String) {
    let Ok(v) = serde_json::from_str::<Value>(raw_params) else {
        return (String::new(), String::new());
    };
    let name = v.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string();
    let args = v.get("arguments");
    let action = ["what", "action"]
        .iter()
        .find_map(|k| args.and_then(|a| a.get(*k)).and_then(|x| x.as_str()))
        .unwrap_or("")
        .to_string();
    (name, action)
}
