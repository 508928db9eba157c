pub mod alerts;
pub mod analyze;
pub mod args;
pub mod checkpoint;
pub mod configure;
pub mod interact;
pub mod mcp;
pub mod observe;
pub mod pending;
pub mod registry;
pub mod response;
pub mod summarize;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tabscope_core::{Config, Result};
use tabscope_storage::CaptureStore;

use crate::alerts::AlertTracker;
use crate::checkpoint::CheckpointManager;
use crate::pending::QueryDispatcher;

pub use registry::ToolRegistry;

/// Truncate a string to at most `max_bytes` bytes, respecting UTF-8 char boundaries.
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Shared daemon state handed to every tool call and HTTP handler.
#[derive(Clone)]
pub struct ToolContext {
    pub config: Arc<Config>,
    pub capture: Arc<CaptureStore>,
    pub queries: Arc<QueryDispatcher>,
    pub checkpoints: Arc<CheckpointManager>,
    pub alerts: Arc<AlertTracker>,
    pub started_at: Instant,
}

impl ToolContext {
    pub fn new(config: Config) -> Self {
        let capture = Arc::new(CaptureStore::new(&config));
        let queries = Arc::new(QueryDispatcher::new(&config.queries));
        Self {
            config: Arc::new(config),
            capture,
            queries,
            checkpoints: Arc::new(CheckpointManager::new()),
            alerts: Arc::new(AlertTracker::new()),
            started_at: Instant::now(),
        }
    }
}

pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// Inline image attached to a tool result (screenshots).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolImage {
    pub mime_type: String,
    pub data: String,
}

/// What a tool hands back: a one-line summary, a JSON body, and optionally an image.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub summary: String,
    pub data: Value,
    pub image: Option<ToolImage>,
}

impl ToolOutput {
    pub fn new(summary: impl Into<String>, data: Value) -> Self {
        Self {
            summary: summary.into(),
            data,
            image: None,
        }
    }

    pub fn with_image(mut self, image: ToolImage) -> Self {
        self.image = Some(image);
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    fn validate(&self, params: &Value) -> Result<()>;
    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolOutput>;
}
