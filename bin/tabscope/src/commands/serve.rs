//! `tabscope serve`: MCP over stdio plus the extension endpoint.

use std::sync::Arc;
use tokio::io::{AsyncWrite, BufReader};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use tabscope_core::{Config, Error, Paths};
use tabscope_tools::mcp::framing::write_frame;
use tabscope_tools::mcp::{Frame, FrameReader, McpServer};
use tabscope_tools::ToolContext;

use super::{gateway, status};

type SharedWriter<W> = Arc<Mutex<W>>;

/// Runs one message and writes the reply in the framing it arrived in.
async fn answer<W: AsyncWrite + Unpin + Send>(server: &McpServer, frame: Frame, out: &SharedWriter<W>) {
    let Some(resp) = server.dispatch(&frame.payload).await else {
        return;
    };
    let payload = match serde_json::to_string(&resp) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "Failed to encode MCP response");
            return;
        }
    };
    let mut w = out.lock().await;
    if let Err(e) = write_frame(&mut *w, &payload, frame.framing).await {
        error!(error = %e, "Failed to write MCP response");
    }
}

pub async fn run(port: Option<u16>, no_http: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths)?;
    if let Some(p) = port {
        config.port = p;
    }
    let port = config.port;
    let max_content_length = config.mcp.max_content_length;

    let ctx = ToolContext::new(config);
    let sweeper = ctx.queries.spawn_sweeper(Arc::clone(&ctx.capture));

    // ── Extension endpoint ──
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_handle = if no_http {
        info!("Extension endpoint disabled");
        None
    } else if status::probe(port).await.is_some() {
        info!(port, "Another tabscope already serves the extension endpoint, running MCP only");
        None
    } else {
        let mut rx = shutdown_tx.subscribe();
        let http_ctx = ctx.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.recv().await;
            };
            if let Err(e) = gateway::serve(http_ctx, port, shutdown).await {
                error!(error = %e, "Extension endpoint failed");
            }
        }))
    };

    // ── MCP over stdio ──
    let server = Arc::new(McpServer::new(ctx));
    let stdout: SharedWriter<tokio::io::Stdout> = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut reader = FrameReader::new(BufReader::new(tokio::io::stdin()), max_content_length);
    info!(version = env!("CARGO_PKG_VERSION"), "MCP server ready on stdio");

    loop {
        tokio::select! {
            frame = reader.next_frame() => match frame {
                Ok(Some(frame)) => {
                    debug!(framing = ?frame.framing, bytes = frame.payload.len(), "MCP ← frame");
                    let server = Arc::clone(&server);
                    let out = Arc::clone(&stdout);
                    tokio::spawn(async move { answer(&server, frame, &out).await });
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(Error::Transport(msg)) => warn!(error = %msg, "Dropping malformed frame"),
                Err(e) => {
                    error!(error = %e, "stdin read failed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(());
    sweeper.abort();
    if let Some(handle) = http_handle {
        if tokio::time::timeout(std::time::Duration::from_secs(5), handle).await.is_err() {
            warn!("Extension endpoint did not stop in time");
        }
    }
    info!("tabscope stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabscope_tools::mcp::Framing;

    #[tokio::test]
    async fn test_answer_echoes_framing() {
        let server = McpServer::new(ToolContext::new(Config::default()));
        let out: SharedWriter<Vec<u8>> = Arc::new(Mutex::new(Vec::new()));

        let frame = Frame {
            payload: r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string(),
            framing: Framing::ContentLength,
        };
        answer(&server, frame, &out).await;
        let written = String::from_utf8(out.lock().await.clone()).unwrap();
        assert!(written.starts_with("Content-Length: "));
        assert!(written.ends_with(r#""result":{}}"#));

        out.lock().await.clear();
        let frame = Frame {
            payload: r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#.to_string(),
            framing: Framing::Line,
        };
        answer(&server, frame, &out).await;
        let written = String::from_utf8(out.lock().await.clone()).unwrap();
        assert!(written.starts_with('{'));
        assert!(written.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_notifications_write_nothing() {
        let server = McpServer::new(ToolContext::new(Config::default()));
        let out: SharedWriter<Vec<u8>> = Arc::new(Mutex::new(Vec::new()));
        let frame = Frame {
            payload: r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string(),
            framing: Framing::Line,
        };
        answer(&server, frame, &out).await;
        assert!(out.lock().await.is_empty());
    }
}
