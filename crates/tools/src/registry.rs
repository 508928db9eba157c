use std::collections::HashMap;
use std::sync::Arc;
use serde_json::{json, Value};
use tabscope_core::{Error, Result};
use tracing::{debug, warn};

use crate::analyze::AnalyzeTool;
use crate::configure::ConfigureTool;
use crate::interact::InteractTool;
use crate::observe::ObserveTool;
use crate::{Tool, ToolContext, ToolOutput};

#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        // Passive buffer reads
        registry.register(Arc::new(ObserveTool));

        // Derived views and extension-side inspection
        registry.register(Arc::new(AnalyzeTool));

        // Page automation through the extension
        registry.register(Arc::new(InteractTool));

        // Checkpoints, buffer clearing, daemon health
        registry.register(Arc::new(ConfigureTool));

        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        debug!(name = schema.name, "Registering tool");
        self.tools.insert(schema.name.to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Tool list in MCP `tools/list` shape, sorted by name.
    pub fn mcp_tool_list(&self) -> Vec<Value> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                let schema = tool.schema();
                json!({
                    "name": schema.name,
                    "description": schema.description,
                    "inputSchema": schema.parameters
                })
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub async fn execute(&self, name: &str, ctx: ToolContext, params: Value) -> Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Unknown tool: {}", name)))?;

        if let Err(e) = tool.validate(&params) {
            warn!(tool = name, error = %e, "Tool validation failed");
            return Err(e);
        }

        debug!(tool = name, "Executing tool");
        tool.execute(ctx, params).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
