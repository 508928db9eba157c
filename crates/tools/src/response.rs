//! Tool-result envelopes: JSON results with a one-line summary, structured
//! errors an LLM can act on, and the freshness metadata attached to every
//! buffer-backed view.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tabscope_core::Error;
use tabscope_storage::CaptureStore;

use crate::mcp::protocol::{ContentBlock, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidJson,
    MissingParam,
    InvalidParam,
    UnknownMode,
    NotInitialized,
    NoData,
    ExtensionTimeout,
    ExtensionError,
    InvalidCursor,
    StaleCursor,
    Internal,
    MarshalFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "invalid_json",
            ErrorCode::MissingParam => "missing_param",
            ErrorCode::InvalidParam => "invalid_param",
            ErrorCode::UnknownMode => "unknown_mode",
            ErrorCode::NotInitialized => "not_initialized",
            ErrorCode::NoData => "no_data",
            ErrorCode::ExtensionTimeout => "extension_timeout",
            ErrorCode::ExtensionError => "extension_error",
            ErrorCode::InvalidCursor => "invalid_cursor",
            ErrorCode::StaleCursor => "stale_cursor",
            ErrorCode::Internal => "internal",
            ErrorCode::MarshalFailed => "marshal_failed",
        }
    }

    fn default_retry(self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "Fix the JSON arguments and call again",
            ErrorCode::MissingParam => "Add the missing parameter and call again",
            ErrorCode::InvalidParam => "Fix the parameter value and call again",
            ErrorCode::UnknownMode => "Use a mode listed in the tool schema",
            ErrorCode::NotInitialized => "Wait for the browser extension to connect, then retry",
            ErrorCode::NoData => "Reproduce the activity in the browser, then query again",
            ErrorCode::ExtensionTimeout => "Browser extension did not respond in time; wait a moment and retry",
            ErrorCode::ExtensionError => "Inspect the error message; the page may block this operation",
            ErrorCode::InvalidCursor => "Query again without a cursor",
            ErrorCode::StaleCursor => "Retry with restart_on_eviction=true or without a cursor",
            ErrorCode::Internal => "Retry the call; report the issue if it persists",
            ErrorCode::MarshalFailed => "Retry with a smaller limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    pub error: String,
    pub message: String,
    pub retry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl StructuredError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: code.as_str().to_string(),
            message: message.into(),
            retry: code.default_retry().to_string(),
            param: None,
            hint: None,
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Line one is human-readable, line two is the machine-readable body.
    pub fn into_result(self) -> ToolResult {
        let body = serde_json::to_string(&self).unwrap_or_else(|_| "{}".to_string());
        ToolResult {
            content: vec![ContentBlock::Text {
                text: format!("Error: {} — {}\n{}", self.error, self.message, body),
            }],
            is_error: true,
        }
    }
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidParam { param, message } => {
                StructuredError::new(ErrorCode::InvalidParam, message.clone()).with_param(param.clone())
            }
            Error::MissingParam(param) => {
                StructuredError::new(ErrorCode::MissingParam, format!("Required parameter '{}' is missing", param))
                    .with_param(param.clone())
            }
            Error::UnknownMode(msg) => StructuredError::new(ErrorCode::UnknownMode, msg.clone()),
            Error::InvalidCursor(msg) => StructuredError::new(ErrorCode::InvalidCursor, msg.clone()),
            Error::StaleCursor(msg) => StructuredError::new(ErrorCode::StaleCursor, msg.clone())
                .with_hint("Set restart_on_eviction=true to resume from the oldest retained entry"),
            Error::ExtensionTimeout(msg) => StructuredError::new(ErrorCode::ExtensionTimeout, msg.clone())
                .with_hint("Check that the extension is connected and tracking a tab"),
            Error::Extension(msg) => StructuredError::new(ErrorCode::ExtensionError, msg.clone()),
            Error::NoData(msg) | Error::NotFound(msg) => StructuredError::new(ErrorCode::NoData, msg.clone()),
            Error::Json(e) => StructuredError::new(ErrorCode::InvalidJson, e.to_string()),
            Error::Validation(msg) => StructuredError::new(ErrorCode::InvalidParam, msg.clone()),
            other => StructuredError::new(ErrorCode::Internal, other.to_string()),
        }
    }
}

pub fn error_result(err: &Error) -> ToolResult {
    StructuredError::from(err).into_result()
}

/// `summary + "\n" + compact JSON`.
pub fn json_result(summary: &str, data: &Value) -> ToolResult {
    match serde_json::to_string(data) {
        Ok(json) => ToolResult::text(format!("{}\n{}", summary, json)),
        Err(e) => StructuredError::new(ErrorCode::MarshalFailed, e.to_string()).into_result(),
    }
}

/// Freshness of a buffer-backed response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub retrieved_at: String,
    pub is_stale: bool,
    pub data_age: String,
}

impl ResponseMetadata {
    pub fn new(capture: &CaptureStore, newest: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        let data_age = match newest {
            Some(t) => format!("{:.1}s", (now - t).num_milliseconds().max(0) as f64 / 1000.0),
            None => "no_data".to_string(),
        };
        Self {
            retrieved_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            is_stale: !capture.extension_connected(),
            data_age,
        }
    }
}

/// Merges `meta` into `data["metadata"]`, keeping any pagination fields already there.
pub fn attach_metadata(data: &mut Value, meta: &ResponseMetadata) {
    let Some(obj) = data.as_object_mut() else {
        return;
    };
    let entry = obj.entry("metadata").or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let (Some(target), Ok(Value::Object(extra))) = (entry.as_object_mut(), serde_json::to_value(meta)) {
        target.extend(extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabscope_core::Config;

    fn lines(result: &ToolResult) -> (String, StructuredError) {
        let text = result.first_text().unwrap();
        let (first, second) = text.split_once('\n').unwrap();
        (first.to_string(), serde_json::from_str(second).unwrap())
    }

    #[test]
    fn test_structured_error_format() {
        let result = StructuredError::new(ErrorCode::MissingParam, "Parameter 'what' is missing")
            .with_param("what")
            .into_result();
        assert!(result.is_error);
        let (first, body) = lines(&result);
        assert!(first.starts_with("Error: missing_param"));
        assert_eq!(body.param.as_deref(), Some("what"));
        assert!(body.retry.contains(' '));
    }

    #[test]
    fn test_error_mapping() {
        let (_, body) = lines(&error_result(&Error::invalid_param("scope", "Invalid scope: x")));
        assert_eq!(body.error, "invalid_param");
        assert_eq!(body.param.as_deref(), Some("scope"));

        let (_, body) = lines(&error_result(&Error::ExtensionTimeout("no answer".into())));
        assert_eq!(body.error, "extension_timeout");
        assert!(body.hint.is_some());

        let (_, body) = lines(&error_result(&Error::Extension("CSP blocked".into())));
        assert_eq!(body.error, "extension_error");

        let (_, body) = lines(&error_result(&Error::StaleCursor("gone".into())));
        assert_eq!(body.error, "stale_cursor");
    }

    #[test]
    fn test_json_result_layout() {
        let result = json_result("2 entries", &json!({"count": 2}));
        assert_eq!(result.first_text().unwrap(), "2 entries\n{\"count\":2}");
        assert!(!result.is_error);
    }

    #[test]
    fn test_metadata_merge_and_staleness() {
        let capture = CaptureStore::new(&Config::default());
        let meta = ResponseMetadata::new(&capture, None);
        assert!(meta.is_stale);
        assert_eq!(meta.data_age, "no_data");

        let mut data = json!({"logs": [], "metadata": {"total": 0}});
        attach_metadata(&mut data, &meta);
        assert_eq!(data["metadata"]["total"], 0);
        assert_eq!(data["metadata"]["is_stale"], true);

        capture.record_sync("s", "1.0");
        let meta = ResponseMetadata::new(&capture, Some(Utc::now()));
        assert!(!meta.is_stale);
        assert!(meta.data_age.ends_with('s'));
    }
}
