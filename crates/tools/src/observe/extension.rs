//! Modes answered by the extension on demand, plus the async command ledger.

use serde_json::{json, Value};
use std::time::Duration;

use tabscope_core::{Error, Result};

use super::tracked_tab;
use crate::args;
use crate::mcp::timeout::ASYNC_CORRELATION_PREFIX;
use crate::pending::{CommandStatus, QueryType};
use crate::{ToolContext, ToolImage, ToolOutput};

const STATE_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(20);
/// Stays under the 65s blocking-poll request budget.
const COMMAND_WAIT: Duration = Duration::from_secs(60);
const STORAGE_TYPES: [&str; 4] = ["local", "session", "cookies", "all"];

async fn state_capture(ctx: &ToolContext, params: Value) -> Result<Value> {
    ctx.queries
        .query(QueryType::StateCapture, params, tracked_tab(&ctx.capture), STATE_QUERY_TIMEOUT)
        .await
}

pub(super) async fn storage(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let storage_type = match args::opt_str(params, "storage_type") {
        Some(_) => args::one_of(params, "storage_type", &STORAGE_TYPES)?,
        None => "all",
    };
    let data = state_capture(ctx, json!({"kind": "storage", "storage_type": storage_type})).await?;
    Ok(ToolOutput::new(format!("Browser storage ({})", storage_type), data))
}

pub(super) async fn indexeddb(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let database = args::opt_str(params, "database");
    let store = args::opt_str(params, "store");
    if store.is_some() && database.is_none() {
        return Err(Error::MissingParam("database".to_string()));
    }
    let limit = args::limit(params, 50, 500);
    let mut query = json!({"kind": "indexeddb", "limit": limit});
    if let Some(db) = database {
        query["database"] = json!(db);
    }
    if let Some(s) = store {
        query["store"] = json!(s);
    }
    let data = state_capture(ctx, query).await?;
    let summary = match (database, store) {
        (Some(db), Some(s)) => format!("IndexedDB {}/{}", db, s),
        (Some(db), None) => format!("IndexedDB {}", db),
        _ => "IndexedDB databases".to_string(),
    };
    Ok(ToolOutput::new(summary, data))
}

/// Splits `data:<mime>;base64,<payload>`.
fn parse_data_url(url: &str) -> Option<ToolImage> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    Some(ToolImage {
        mime_type: mime.to_string(),
        data: payload.to_string(),
    })
}

fn screenshot_image(answer: &Value) -> Option<ToolImage> {
    if let Some(url) = answer.get("data_url").and_then(Value::as_str) {
        return parse_data_url(url);
    }
    let data = answer.get("data").and_then(Value::as_str)?;
    let mime_type = answer
        .get("mime_type")
        .and_then(Value::as_str)
        .unwrap_or("image/png");
    Some(ToolImage {
        mime_type: mime_type.to_string(),
        data: data.to_string(),
    })
}

pub(super) async fn screenshot(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let Some(tab_id) = tracked_tab(&ctx.capture) else {
        return Err(Error::NoData(
            "No tab is being tracked; enable tracking in the extension first".to_string(),
        ));
    };
    let format = match args::opt_str(params, "format") {
        Some(_) => args::one_of(params, "format", &["png", "jpeg"])?,
        None => "png",
    };
    let mut query = json!({
        "format": format,
        "full_page": args::bool_or(params, "full_page", false),
    });
    if let Some(q) = args::opt_i64(params, "quality") {
        if !(1..=100).contains(&q) {
            return Err(Error::invalid_param("quality", "quality must be between 1 and 100"));
        }
        query["quality"] = json!(q);
    }
    if let Some(sel) = args::opt_str(params, "selector") {
        query["selector"] = json!(sel);
    }

    let answer = ctx
        .queries
        .query(QueryType::Screenshot, query, Some(tab_id), SCREENSHOT_TIMEOUT)
        .await?;
    let image = screenshot_image(&answer)
        .ok_or_else(|| Error::Extension("screenshot answer carried no image data".to_string()))?;
    let data = json!({
        "tab_id": tab_id,
        "format": format,
        "mime_type": image.mime_type,
        "bytes_base64": image.data.len(),
    });
    Ok(ToolOutput::new("Screenshot captured", data).with_image(image))
}

pub(super) async fn command_result(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let cid = args::require_str(params, "correlation_id")?;
    let mut record = ctx
        .queries
        .command(cid)
        .ok_or_else(|| Error::NoData(format!("No command with correlation_id '{}'", cid)))?;
    if record.status == CommandStatus::Pending && cid.starts_with(ASYNC_CORRELATION_PREFIX) {
        if let Some(done) = ctx.queries.wait_for_command(cid, COMMAND_WAIT).await {
            record = done;
        }
    }
    let summary = format!("Command {}: {}", cid, record.status.as_str());
    Ok(ToolOutput::new(summary, serde_json::to_value(&record)?))
}

pub(super) fn pending_commands(ctx: &ToolContext) -> Result<ToolOutput> {
    let commands = ctx.queries.pending_commands();
    let data = json!({ "commands": commands, "count": commands.len() });
    Ok(ToolOutput::new("Pending commands", data))
}

pub(super) fn failed_commands(ctx: &ToolContext) -> Result<ToolOutput> {
    let commands = ctx.queries.failed_commands();
    let data = json!({ "commands": commands, "count": commands.len() });
    Ok(ToolOutput::new("Failed commands", data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabscope_core::Config;
    use tabscope_storage::TrackingStatus;

    fn tracked_ctx() -> ToolContext {
        let ctx = ToolContext::new(Config::default());
        ctx.capture.set_tracking(TrackingStatus {
            enabled: true,
            tab_id: Some(3),
            ..Default::default()
        });
        ctx
    }

    /// Plays the extension: answers the first delivered query with `answer`.
    fn answer_next(ctx: &ToolContext, answer: Value) -> tokio::task::JoinHandle<Value> {
        let queries = ctx.queries.clone();
        tokio::spawn(async move {
            loop {
                if let Some(q) = queries.take_undelivered().into_iter().next() {
                    queries.resolve(&q.id, Ok(answer));
                    return q.params;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    #[test]
    fn test_parse_data_url() {
        let img = parse_data_url("data:image/jpeg;base64,AAAA").unwrap();
        assert_eq!(img.mime_type, "image/jpeg");
        assert_eq!(img.data, "AAAA");
        assert!(parse_data_url("https://a.test/x.png").is_none());
    }

    #[tokio::test]
    async fn test_screenshot_requires_tracking() {
        let ctx = ToolContext::new(Config::default());
        let err = screenshot(&ctx, &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::NoData(_)));

        let ctx = tracked_ctx();
        let err = screenshot(&ctx, &json!({"quality": 0})).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParam { .. }));
    }

    #[tokio::test]
    async fn test_screenshot_attaches_image() {
        let ctx = tracked_ctx();
        let ext = answer_next(&ctx, json!({"data_url": "data:image/png;base64,iVBOR"}));
        let out = screenshot(&ctx, &json!({"format": "png"})).await.unwrap();
        assert_eq!(ext.await.unwrap()["format"], "png");
        let image = out.image.unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.data, "iVBOR");
    }

    #[tokio::test]
    async fn test_storage_forwards_kind() {
        let ctx = tracked_ctx();
        let ext = answer_next(&ctx, json!({"local": {"k": "v"}}));
        let out = storage(&ctx, &json!({"storage_type": "local"})).await.unwrap();
        let sent = ext.await.unwrap();
        assert_eq!(sent["kind"], "storage");
        assert_eq!(sent["storage_type"], "local");
        assert_eq!(out.data["local"]["k"], "v");
    }

    #[tokio::test]
    async fn test_indexeddb_store_needs_database() {
        let ctx = tracked_ctx();
        let err = indexeddb(&ctx, &json!({"store": "items"})).await.unwrap_err();
        assert!(matches!(err, Error::MissingParam(ref p) if p == "database"));
    }

    #[tokio::test]
    async fn test_command_result_lookup() {
        let ctx = tracked_ctx();
        assert!(matches!(
            command_result(&ctx, &json!({})).await,
            Err(Error::MissingParam(_))
        ));
        assert!(matches!(
            command_result(&ctx, &json!({"correlation_id": "ann_missing"})).await,
            Err(Error::NoData(_))
        ));

        let ticket = ctx.queries.create(
            QueryType::Execute,
            json!({}),
            None,
            Some("ann_1".into()),
            Duration::from_secs(30),
        );
        let queries = ctx.queries.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queries.resolve(&ticket.id, Ok(json!({"value": 42})));
        });
        let out = command_result(&ctx, &json!({"correlation_id": "ann_1"})).await.unwrap();
        assert_eq!(out.data["status"], "complete");
        assert_eq!(out.data["result"]["value"], 42);
        assert_eq!(pending_commands(&ctx).unwrap().data["count"], 0);
    }
}
