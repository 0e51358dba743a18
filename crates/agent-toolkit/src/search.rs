//! Web Search Tool
//!
//! Simulated results; no network access.

use async_trait::async_trait;
use serde_json::{json, Value};

use agent_core::{tool::ParameterSchema, Result as CoreResult, Tool, ToolSchema};

pub const MAX_RESULTS: u64 = 10;

/// Tool returning (simulated) search results
pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("search_web", "Search the web and return a list of results.")
            .param(ParameterSchema::required("query", "string", "Search keywords"))
            .param(
                ParameterSchema::optional("num_results", "integer", "Number of results (at most 10)")
                    .with_default(json!(5)),
            )
            .category("search")
    }

    async fn execute(&self, arguments: &Value) -> CoreResult<Value> {
        let query = arguments["query"].as_str().unwrap_or_default();
        let count = arguments["num_results"]
            .as_u64()
            .unwrap_or(5)
            .clamp(1, MAX_RESULTS);

        let results: Vec<Value> = (1..=count)
            .map(|i| {
                json!({
                    "title": format!("Result {i} for '{query}'"),
                    "url": format!("https://example.com/result{i}"),
                    "snippet": format!("Summary of search result {i} about '{query}'..."),
                })
            })
            .collect();

        tracing::debug!(query, returned = results.len(), "Simulated web search");
        Ok(json!({ "query": query, "results": results }))
    }
}
