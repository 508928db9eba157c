use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferConfig {
    #[serde(default = "default_logs_capacity")]
    pub logs: usize,
    #[serde(default = "default_extension_logs_capacity")]
    pub extension_logs: usize,
    #[serde(default = "default_waterfall_capacity")]
    pub waterfall: usize,
    #[serde(default = "default_network_bodies_capacity")]
    pub network_bodies: usize,
    #[serde(default = "default_websocket_events_capacity")]
    pub websocket_events: usize,
    #[serde(default = "default_actions_capacity")]
    pub actions: usize,
}

fn default_logs_capacity() -> usize {
    1000
}

fn default_extension_logs_capacity() -> usize {
    500
}

fn default_waterfall_capacity() -> usize {
    1000
}

fn default_network_bodies_capacity() -> usize {
    100
}

fn default_websocket_events_capacity() -> usize {
    500
}

fn default_actions_capacity() -> usize {
    50
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            logs: default_logs_capacity(),
            extension_logs: default_extension_logs_capacity(),
            waterfall: default_waterfall_capacity(),
            network_bodies: default_network_bodies_capacity(),
            websocket_events: default_websocket_events_capacity(),
            actions: default_actions_capacity(),
        }
    }
}

/// Byte thresholds for capture-fidelity degradation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    #[serde(default = "default_soft_limit")]
    pub soft_limit_bytes: usize,
    #[serde(default = "default_hard_limit")]
    pub hard_limit_bytes: usize,
}

fn default_soft_limit() -> usize {
    20 * 1024 * 1024
}

fn default_hard_limit() -> usize {
    50 * 1024 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            soft_limit_bytes: default_soft_limit(),
            hard_limit_bytes: default_hard_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfig {
    /// Upper bound for a Content-Length framed body.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

fn default_max_content_length() -> usize {
    10 * 1024 * 1024
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            max_content_length: default_max_content_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    #[serde(default = "default_query_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_query_timeout_ms() -> u64 {
    15_000
}

fn default_result_ttl_secs() -> u64 {
    60
}

fn default_max_pending() -> usize {
    5
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_query_timeout_ms(),
            result_ttl_secs: default_result_ttl_secs(),
            max_pending: default_max_pending(),
        }
    }
}

impl QueryConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub queries: QueryConfig,
}

fn default_port() -> u16 {
    7890
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            buffers: BufferConfig::default(),
            memory: MemoryConfig::default(),
            mcp: McpConfig::default(),
            queries: QueryConfig::default(),
        }
    }
}

impl Config {
    /// Parses the config file. JSON5 is accepted so hand-edited files may carry
    /// comments and trailing commas.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = json5::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory.soft_limit_bytes >= self.memory.hard_limit_bytes {
            return Err(Error::Config(
                "memory.softLimitBytes must be below memory.hardLimitBytes".to_string(),
            ));
        }
        if self.queries.max_pending == 0 {
            return Err(Error::Config("queries.maxPending must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_object() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.port, 7890);
        assert_eq!(cfg.buffers.logs, 1000);
        assert_eq!(cfg.buffers.network_bodies, 100);
        assert_eq!(cfg.memory.soft_limit_bytes, 20 * 1024 * 1024);
        assert_eq!(cfg.queries.max_pending, 5);
    }

    #[test]
    fn test_partial_override() {
        let raw = r#"{ "port": 9000, "buffers": { "actions": 10 } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.buffers.actions, 10);
        assert_eq!(cfg.buffers.logs, 1000);
    }

    #[test]
    fn test_load_json5_with_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            "{\n  // local override\n  port: 7001,\n  queries: { resultTtlSecs: 5, },\n}\n",
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.port, 7001);
        assert_eq!(cfg.queries.result_ttl(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let cfg = Config::load_or_default(&paths).unwrap();
        assert_eq!(cfg.port, 7890);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().join("nested"));
        let mut cfg = Config::default();
        cfg.port = 7100;
        cfg.save(&paths.config_file()).unwrap();
        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.port, 7100);
    }

    #[test]
    fn test_rejects_inverted_memory_limits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "memory": { "softLimitBytes": 100, "hardLimitBytes": 10 } }"#,
        )
        .unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
