use serde_json::Value;
use std::time::Duration;

use tabscope_core::{Config, Paths};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// `/health` of a daemon on `port`, if one answers.
pub async fn probe(port: u16) -> Option<Value> {
    let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build().ok()?;
    let resp = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json::<Value>().await.ok()
}

pub async fn run(port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = paths.config_file();
    let config_exists = config_path.exists();

    println!("tabscope status");
    println!("===============");
    println!();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found, using defaults)" }
    );

    let config = Config::load_or_default(&paths)?;
    let port = port.unwrap_or(config.port);

    let Some(health) = probe(port).await else {
        println!("Daemon:    ✗ nothing answering on 127.0.0.1:{}", port);
        println!();
        println!("Start one with `tabscope serve`, or let your MCP client launch it.");
        return Ok(());
    };

    let version = health.get("version").and_then(Value::as_str).unwrap_or("?");
    let uptime = health.get("uptime_secs").and_then(Value::as_u64).unwrap_or(0);
    println!("Daemon:    ✓ v{} on 127.0.0.1:{} (up {}s)", version, port, uptime);

    let connected = health
        .get("extension_connected")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    println!(
        "Extension: {}",
        if connected { "✓ connected" } else { "✗ not syncing" }
    );
    let pending = health.get("pending_queries").and_then(Value::as_u64).unwrap_or(0);
    println!("Queries:   {} pending", pending);

    if let Some(buffers) = health.get("buffers").and_then(Value::as_object) {
        println!();
        println!("Buffers:");
        for (name, stat) in buffers {
            let len = stat.get("len").and_then(Value::as_u64).unwrap_or(0);
            let cap = stat.get("capacity").and_then(Value::as_u64).unwrap_or(0);
            let total = stat.get("total_added").and_then(Value::as_u64).unwrap_or(0);
            println!("  {:<18} {:>5}/{:<5} ({} total)", name, len, cap, total);
        }
    }
    Ok(())
}
