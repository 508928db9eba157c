use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use tabscope_core::{Error, Result};

use crate::alerts::regressed_metrics;
use crate::args::{self, contains_ignore_case};
use crate::observe::tracked_tab;
use crate::pending::QueryType;
use crate::{Tool, ToolContext, ToolOutput, ToolSchema};

pub const ANALYZE_MODES: [&str; 3] = ["performance", "dom", "accessibility"];

/// Tool for analyses that go beyond reading a single buffer: performance
/// against per-URL baselines, DOM queries and accessibility audits.
pub struct AnalyzeTool;

#[async_trait]
impl Tool for AnalyzeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "analyze",
            description: "Analyze the tracked page. 'performance' compares the latest snapshots with their rolling baselines and lists regressions. 'dom' runs a CSS selector query in the page. 'accessibility' runs an accessibility audit in the page.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "what": {
                        "type": "string",
                        "enum": ANALYZE_MODES,
                        "description": "Which analysis to run"
                    },
                    "url": {
                        "type": "string",
                        "description": "(performance) URL substring filter"
                    },
                    "selector": {
                        "type": "string",
                        "description": "(dom) CSS selector to query"
                    },
                    "scope": {
                        "type": "string",
                        "description": "(accessibility) CSS selector limiting the audit to a subtree"
                    },
                    "tags": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "(accessibility) Rule tags such as wcag2a, wcag2aa"
                    }
                },
                "required": ["what"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let what = args::require_str(params, "what")?;
        if !ANALYZE_MODES.contains(&what) {
            return Err(Error::UnknownMode(format!(
                "Unknown analyze mode '{}'. Valid: {}",
                what,
                ANALYZE_MODES.join(", ")
            )));
        }
        if what == "dom" {
            args::require_str(params, "selector")?;
        }
        Ok(())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolOutput> {
        let what = args::require_str(&params, "what")?;
        debug!(what, "analyze execute");
        match what {
            "performance" => performance(&ctx, &params),
            "dom" => {
                let selector = args::require_str(&params, "selector")?;
                let query = json!({"mode": "dom_query", "selector": selector});
                let data = page_query(&ctx, QueryType::Dom, query).await?;
                Ok(ToolOutput::new(format!("DOM query '{}'", selector), data))
            }
            "accessibility" => {
                let mut query = json!({"mode": "a11y_audit"});
                if let Some(scope) = args::opt_str(&params, "scope") {
                    query["scope"] = json!(scope);
                }
                let tags = args::string_list(&params, "tags");
                if !tags.is_empty() {
                    query["tags"] = json!(tags);
                }
                let data = page_query(&ctx, QueryType::Accessibility, query).await?;
                Ok(ToolOutput::new("Accessibility audit", data))
            }
            other => Err(Error::UnknownMode(format!("Unknown analyze mode '{}'", other))),
        }
    }
}

async fn page_query(ctx: &ToolContext, kind: QueryType, query: Value) -> Result<Value> {
    let timeout = ctx.config.queries.default_timeout();
    ctx.queries
        .query(kind, query, tracked_tab(&ctx.capture), timeout)
        .await
}

fn performance(ctx: &ToolContext, params: &Value) -> Result<ToolOutput> {
    let url = args::opt_str(params, "url").unwrap_or("");
    let pages: Vec<Value> = ctx.capture.with_performance(|perf| {
        perf.snapshots()
            .iter()
            .filter(|s| contains_ignore_case(&s.url, url))
            .map(|snap| {
                let baseline = perf.baseline(&snap.url);
                let regressions = baseline
                    .filter(|b| b.sample_count >= 1)
                    .map(|b| regressed_metrics(snap, b))
                    .unwrap_or_default();
                json!({
                    "url": snap.url,
                    "timestamp": snap.timestamp,
                    "timing": snap.timing,
                    "network": snap.network,
                    "long_tasks": snap.long_tasks,
                    "cumulative_layout_shift": snap.cls,
                    "baseline": baseline.map(|b| json!({
                        "sample_count": b.sample_count,
                        "timing": b.timing,
                        "network": b.network,
                    })),
                    "regressions": regressions,
                })
            })
            .collect()
    });
    let alerts: Vec<_> = ctx
        .alerts
        .all()
        .into_iter()
        .filter(|a| contains_ignore_case(&a.url, url))
        .collect();
    let summary = format!("Performance for {} page(s), {} alert(s)", pages.len(), alerts.len());
    let data = json!({ "pages": pages, "alerts": alerts });
    Ok(ToolOutput::new(summary, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tabscope_core::types::{PerformanceSnapshot, PerformanceTiming};
    use tabscope_core::Config;

    fn snapshot(load: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            url: "https://a.test/".into(),
            timestamp: "2024-05-01T10:00:00Z".into(),
            timing: PerformanceTiming {
                load,
                dom_content_loaded: load / 2.0,
                time_to_first_byte: 50.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_validate() {
        let tool = AnalyzeTool;
        assert!(tool.validate(&json!({"what": "performance"})).is_ok());
        assert!(matches!(tool.validate(&json!({"what": "dom"})), Err(Error::MissingParam(_))));
        assert!(matches!(tool.validate(&json!({"what": "seo"})), Err(Error::UnknownMode(_))));
    }

    #[tokio::test]
    async fn test_performance_reports_regressions() {
        let ctx = ToolContext::new(Config::default());
        ctx.capture.add_performance_snapshot(snapshot(1000.0));
        ctx.capture.add_performance_snapshot(snapshot(3000.0));
        let out = AnalyzeTool
            .execute(ctx.clone(), json!({"what": "performance"}))
            .await
            .unwrap();
        assert_eq!(out.data["pages"].as_array().unwrap().len(), 1);
        let page = &out.data["pages"][0];
        assert!(page["baseline"]["sample_count"].as_u64().unwrap() >= 1);
        assert!(page["regressions"].get("load").is_some());

        let none = AnalyzeTool
            .execute(ctx, json!({"what": "performance", "url": "other.test"}))
            .await
            .unwrap();
        assert!(none.data["pages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dom_query_round_trip() {
        let ctx = ToolContext::new(Config::default());
        let queries = ctx.queries.clone();
        let ext = tokio::spawn(async move {
            loop {
                if let Some(q) = queries.take_undelivered().into_iter().next() {
                    assert_eq!(q.query_type, QueryType::Dom);
                    queries.resolve(&q.id, Ok(json!({"matches": 2})));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let out = AnalyzeTool
            .execute(ctx, json!({"what": "dom", "selector": "li.item"}))
            .await
            .unwrap();
        ext.await.unwrap();
        assert_eq!(out.data["matches"], 2);
    }
}
