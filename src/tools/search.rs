//! `web_search`: instant-answer lookup against a DuckDuckGo-compatible API.
//!
//! The configured endpoint is exempt from the domain allowlist; the scheme
//! rules still apply to it and to any redirect it issues.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;

use super::fetch::WebClient;
use super::{ParamSpec, ParamType, RiskLevel, Tool, ToolArgs, ToolContext, ToolResult};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

fn push_topic(topic: &Value, out: &mut Vec<SearchHit>) {
    if let Some(children) = topic.get("Topics").and_then(Value::as_array) {
        for child in children {
            push_topic(child, out);
        }
        return;
    }
    let text = topic.get("Text").and_then(Value::as_str).unwrap_or("");
    let url = topic.get("FirstURL").and_then(Value::as_str).unwrap_or("");
    if text.is_empty() || url.is_empty() {
        return;
    }
    let title = text.split(" - ").next().unwrap_or(text).to_string();
    out.push(SearchHit {
        title,
        url: url.to_string(),
        snippet: text.to_string(),
    });
}

/// Flatten an instant-answer response into at most `max` hits: the
/// abstract first, then direct results, then related topics.
pub fn parse_instant_answer(json: &Value, max: usize) -> Vec<SearchHit> {
    let mut out = Vec::new();

    let abstract_text = json.get("AbstractText").and_then(Value::as_str).unwrap_or("");
    let abstract_url = json.get("AbstractURL").and_then(Value::as_str).unwrap_or("");
    if !abstract_text.is_empty() && !abstract_url.is_empty() {
        out.push(SearchHit {
            title: json
                .get("Heading")
                .and_then(Value::as_str)
                .unwrap_or(abstract_text)
                .to_string(),
            url: abstract_url.to_string(),
            snippet: abstract_text.to_string(),
        });
    }

    for key in ["Results", "RelatedTopics"] {
        if let Some(items) = json.get(key).and_then(Value::as_array) {
            for item in items {
                push_topic(item, &mut out);
            }
        }
    }

    out.truncate(max);
    out
}

pub struct WebSearchTool {
    client: Arc<WebClient>,
}

impl WebSearchTool {
    pub fn new(client: Arc<WebClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return a short list of titles, URLs and snippets."
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("query", ParamType::String, "Search terms"),
            ParamSpec::optional("max_results", ParamType::Integer, "Maximum number of results"),
        ]
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Low
    }

    fn is_network(&self) -> bool {
        true
    }

    async fn execute(&self, args: &ToolArgs, _ctx: &ToolContext) -> Result<ToolResult> {
        let query = args.require_str("query")?;
        let settings = self.client.settings();
        let max = args
            .usize("max_results")
            .unwrap_or(settings.search_max_results)
            .clamp(1, settings.search_max_results.max(1));

        let mut url = Url::parse(&settings.search_endpoint)
            .with_context(|| format!("invalid search endpoint: {}", settings.search_endpoint))?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("format", "json")
            .append_pair("no_html", "1")
            .append_pair("skip_disambig", "1");

        let page = self
            .client
            .fetch_endpoint(&url, settings.fetch_max_bytes)
            .await?;
        let json: Value = serde_json::from_str(&page.body)
            .with_context(|| "search endpoint returned invalid JSON")?;
        let hits = parse_instant_answer(&json, max);

        Ok(ToolResult::ok(json!({
            "query": query,
            "results": hits,
        })))
    }
}
