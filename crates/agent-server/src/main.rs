//! agent-server
//!
//! Axum server exposing the tool-calling orchestrator over REST and the same
//! tool catalog over the JSON-RPC agent protocol.

mod config;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{LlmProvider, MemorySessionStore, Orchestrator, ProtocolBridge, SessionStore};
use agent_runtime::{JsonlSessionStore, OpenAiCompatProvider};
use agent_toolkit::builtin_registry;

use crate::config::{ServerConfig, StoreKind};
use crate::handlers::{
    clear_session, get_session, health, list_models, list_sessions, list_tools, llm_with_tools, protocol_call,
    protocol_catalog, protocol_rpc,
};
use crate::state::AppState;

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & info
        .route("/health", get(health))
        .route("/api/models", get(list_models))
        // Orchestrator
        .route("/api/v1/llm-with-tools", post(llm_with_tools))
        .route("/api/v1/llm-sessions", get(list_sessions))
        .route("/api/v1/llm-sessions/{id}", get(get_session).delete(clear_session))
        .route("/api/v1/tools", get(list_tools))
        // Agent protocol
        .route("/api/v1/mcp/tools", get(protocol_catalog))
        .route("/api/v1/mcp/tools/call", post(protocol_call))
        .route("/mcp", post(protocol_rpc))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before the filter reads RUST_LOG
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();

    let provider = Arc::new(OpenAiCompatProvider::from_env()?);
    match provider.health_check().await {
        Ok(true) => {
            tracing::info!(base = %provider.config().api_base, "Connected to LLM provider");
            if let Ok(models) = provider.list_models().await {
                tracing::info!(count = models.len(), "Provider models available");
            }
        }
        Ok(false) | Err(_) => {
            tracing::warn!(base = %provider.config().api_base, "LLM provider not reachable, turns will fail");
        }
    }

    let tools = Arc::new(builtin_registry(config.tool_timeout)?);
    tracing::info!(count = tools.len(), tools = ?tools.names(), "Registered tools");

    let store: Arc<dyn SessionStore> = match config.session_store {
        StoreKind::Memory => Arc::new(MemorySessionStore::new()),
        StoreKind::File => Arc::new(JsonlSessionStore::open(config.session_dir.clone()).await?),
    };

    let orchestrator = Orchestrator::builder()
        .provider(provider)
        .tools(tools.clone())
        .store(store)
        .config(config.orchestrator.clone())
        .build()?;
    let bridge = ProtocolBridge::new(tools).with_name(env!("CARGO_PKG_NAME"));

    let app = router(AppState::new(orchestrator, bridge, config.request_timeout));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("agent-server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Endpoints:");
    tracing::info!("  GET    /health                     - Health check");
    tracing::info!("  GET    /api/models                 - List provider models");
    tracing::info!("  POST   /api/v1/llm-with-tools      - Run a turn with tool calling");
    tracing::info!("  GET    /api/v1/llm-sessions        - List sessions");
    tracing::info!("  GET    /api/v1/llm-sessions/{{id}}   - Session history");
    tracing::info!("  DELETE /api/v1/llm-sessions/{{id}}   - Clear a session");
    tracing::info!("  GET    /api/v1/tools               - Tool catalog");
    tracing::info!("  POST   /mcp                        - JSON-RPC agent protocol");

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use agent_core::provider::ModelInfo;
    use agent_core::{AgentError, Completion, GenerationOptions, Message, Result, Role, ToolCall, ToolSchema};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    /// Reacts to keywords in the latest message
    struct StubProvider;

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn send(&self, context: &[Message], _tools: &[ToolSchema], _options: &GenerationOptions) -> Result<Completion> {
            let Some(last) = context.last() else {
                return Err(AgentError::Provider("empty context".into()));
            };
            if last.role == Role::Tool {
                return Ok(Completion::final_answer(format!("The answer is {}", last.content), "stub-model"));
            }
            if last.content.contains("compute") {
                let call = ToolCall::new("calculate", json!({"expression": "15*8+32"})).with_id("call_1");
                return Ok(Completion::tool_calls(vec![call], "stub-model"));
            }
            if last.content.contains("stock") {
                let call = ToolCall::new("inventory", json!({})).with_id("call_stock");
                return Ok(Completion::tool_calls(vec![call], "stub-model"));
            }
            if last.content.contains("upstream") {
                return Err(AgentError::Provider("upstream returned 500: internal detail".into()));
            }
            if last.content.contains("slow") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(Completion::final_answer("hello", "stub-model"))
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Ok(vec![ModelInfo {
                id: "stub-model".into(),
                owned_by: None,
            }])
        }
    }

    fn app(request_timeout: Duration) -> Router {
        let tools = builtin_registry(Duration::from_secs(5)).unwrap();
        tools
            .register_fn("inventory", "Look up stock levels", json!({"type": "object"}), |_args| async {
                Err(AgentError::ToolExecution("query failed on replica db-7 as user admin".into()))
            })
            .unwrap();
        let tools = Arc::new(tools);
        let orchestrator = Orchestrator::builder()
            .provider(Arc::new(StubProvider))
            .tools(tools.clone())
            .build()
            .unwrap();
        router(AppState::new(orchestrator, ProtocolBridge::new(tools), request_timeout))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<String>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn turn(body: &Value) -> Option<String> {
        Some(body.to_string())
    }

    #[tokio::test]
    async fn test_health_reports_provider_and_tools() {
        let app = app(Duration::from_secs(5));
        let (status, body) = call(&app, "GET", "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["provider"], "stub");
        assert_eq!(body["provider_connected"], true);
        assert!(body["tools"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_turn_with_tool_call() {
        let app = app(Duration::from_secs(5));
        let request = json!({"query": "compute 15*8+32", "session_id": "calc-1"});
        let (status, body) = call(&app, "POST", "/api/v1/llm-with-tools", turn(&request)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["session_id"], "calc-1");
        assert!(body["response_text"].as_str().unwrap().contains("152"));
        assert_eq!(body["tools_called"][0]["name"], "calculate");
        assert_eq!(body["tools_called"][0]["arguments"], json!({"expression": "15*8+32"}));
    }

    #[tokio::test]
    async fn test_validation_failures_are_400() {
        let app = app(Duration::from_secs(5));

        let (status, body) = call(&app, "POST", "/api/v1/llm-with-tools", turn(&json!({"query": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error_code"], "VALIDATION_ERROR");

        let (status, body) = call(&app, "POST", "/api/v1/llm-with-tools", Some("{not json".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_tool_failure_detail_stays_internal() {
        let app = app(Duration::from_secs(5));
        let (status, body) = call(&app, "POST", "/api/v1/llm-with-tools", turn(&json!({"query": "check stock"}))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let entry = &body["tools_called"][0];
        assert_eq!(entry["name"], "inventory");
        assert_eq!(entry["status"], "error");
        assert_eq!(entry["error_code"], "TOOL_EXECUTION_ERROR");
        assert!(!entry["error"].as_str().unwrap().contains("db-7"));

        let direct = json!({"name": "inventory", "arguments": {}});
        let (_, body) = call(&app, "POST", "/api/v1/mcp/tools/call", turn(&direct)).await;
        assert_eq!(body["isError"], true);
        assert!(!body["content"][0]["text"].as_str().unwrap().contains("db-7"));
    }

    #[tokio::test]
    async fn test_provider_error_is_502_without_detail() {
        let app = app(Duration::from_secs(5));
        let (status, body) = call(&app, "POST", "/api/v1/llm-with-tools", turn(&json!({"query": "upstream"}))).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error_code"], "PROVIDER_ERROR");
        assert!(!body["error"].as_str().unwrap().contains("internal detail"));
    }

    #[tokio::test]
    async fn test_request_timeout_is_504() {
        let app = app(Duration::from_millis(50));
        let (status, body) = call(&app, "POST", "/api/v1/llm-with-tools", turn(&json!({"query": "slow"}))).await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error_code"], "REQUEST_TIMEOUT");
    }

    #[tokio::test]
    async fn test_session_history_list_and_clear() {
        let app = app(Duration::from_secs(5));
        let request = json!({"query": "compute 15*8+32", "session_id": "s1"});
        call(&app, "POST", "/api/v1/llm-with-tools", turn(&request)).await;

        let (status, body) = call(&app, "GET", "/api/v1/llm-sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"], json!(["s1"]));
        assert_eq!(body["count"], 1);

        let (_, body) = call(&app, "GET", "/api/v1/llm-sessions/s1", None).await;
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);

        let (status, body) = call(&app, "DELETE", "/api/v1/llm-sessions/s1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (_, body) = call(&app, "GET", "/api/v1/llm-sessions/s1", None).await;
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn test_tool_catalog() {
        let app = app(Duration::from_secs(5));
        let (status, body) = call(&app, "GET", "/api/v1/tools", None).await;

        assert_eq!(status, StatusCode::OK);
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(body["count"].as_u64().unwrap() as usize, tools.len());
        let calc = tools.iter().find(|t| t["name"] == "calculate").unwrap();
        assert_eq!(calc["parameters_schema"]["required"], json!(["expression"]));
    }

    #[tokio::test]
    async fn test_protocol_endpoints() {
        let app = app(Duration::from_secs(5));

        let list = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let (status, body) = call(&app, "POST", "/mcp", turn(&list)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 1);
        assert!(body["result"]["tools"].as_array().unwrap().iter().any(|t| t["name"] == "calculate"));

        let notify = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let (status, body) = call(&app, "POST", "/mcp", turn(&notify)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, Value::Null);

        let direct = json!({"name": "calculate", "arguments": {"expression": "2+2"}});
        let (status, body) = call(&app, "POST", "/api/v1/mcp/tools/call", turn(&direct)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isError"], false);
        assert_eq!(body["structuredContent"], json!({"result": "4"}));
    }
}
