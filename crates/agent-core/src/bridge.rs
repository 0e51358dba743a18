//! Protocol Bridge
//!
//! Serves the tool registry to external agents over JSON-RPC 2.0
//! (`initialize`, `ping`, `tools/list`, `tools/call`). Calls go straight to
//! [`ToolRegistry::execute`], the same path the orchestrator uses, and never
//! enter the multi-round reasoning loop.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::jsonrpc::{methods, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION, PROTOCOL_VERSION};
use crate::tool::{ToolCall, ToolInvocation, ToolRegistry, ToolSchema};

/// Catalog entry in the agent protocol's shape
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl From<&ToolSchema> for ToolDescriptor {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            name: schema.name.clone(),
            description: schema.description.clone(),
            input_schema: schema.input_schema(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
}

/// Result of `tools/call`
///
/// Tool-level failures are results with `is_error` set, not protocol errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ContentBlock>,

    #[serde(rename = "structuredContent", default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,

    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl From<&ToolInvocation> for CallToolResult {
    fn from(invocation: &ToolInvocation) -> Self {
        let structured_content = invocation
            .result
            .as_ref()
            .filter(|value| value.is_object())
            .cloned();
        Self {
            content: vec![ContentBlock::Text {
                text: invocation.public_content(),
            }],
            structured_content,
            is_error: !invocation.is_success(),
        }
    }
}

#[derive(Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// Agent-facing view of a [`ToolRegistry`]
pub struct ProtocolBridge {
    registry: Arc<ToolRegistry>,
    server_name: String,
    server_version: String,
}

impl ProtocolBridge {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            server_name: "agent-tools".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Current catalog, ordered by tool name
    pub fn catalog(&self) -> Vec<ToolDescriptor> {
        self.registry.list().iter().map(ToolDescriptor::from).collect()
    }

    /// Run a single tool call
    pub async fn call_tool(&self, name: &str, arguments: Value) -> CallToolResult {
        self.call_tool_with_cancel(name, arguments, &CancellationToken::new())
            .await
    }

    pub async fn call_tool_with_cancel(&self, name: &str, arguments: Value, cancel: &CancellationToken) -> CallToolResult {
        let call = ToolCall::new(name, arguments);
        tracing::info!(tool = %call.name, call_id = %call.id, "Agent protocol tool call");
        let invocation = self.registry.execute_with_cancel(&call, cancel).await;
        CallToolResult::from(&invocation)
    }

    /// Handle one raw JSON-RPC message; `None` for notifications
    pub async fn handle_message(&self, raw: &str) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.handle_value(value).await,
            Err(e) => {
                tracing::debug!(error = %e, "Unparseable agent protocol message");
                Some(JsonRpcResponse::error(None, JsonRpcError::parse_error()))
            }
        }
    }

    /// Handle one decoded JSON-RPC message; `None` for notifications
    pub async fn handle_value(&self, value: Value) -> Option<JsonRpcResponse> {
        let id = value
            .get("id")
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

        let request = match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => request,
            Err(e) => {
                return Some(JsonRpcResponse::error(id, JsonRpcError::invalid_request(e.to_string())));
            }
        };
        if request.jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
            ));
        }

        self.handle_request(request).await
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            self.handle_notification(request).await;
            return None;
        }

        let id = request.id;
        let response = match request.method.as_str() {
            methods::INITIALIZE => JsonRpcResponse::success(id, self.initialize_result()),
            methods::PING => JsonRpcResponse::success(id, json!({})),
            methods::TOOLS_LIST => JsonRpcResponse::success(id, json!({ "tools": self.catalog() })),
            methods::TOOLS_CALL => self.handle_tools_call(id, request.params).await,
            other => JsonRpcResponse::error(id, JsonRpcError::method_not_found(other)),
        };
        Some(response)
    }

    /// Notifications are processed like requests; only the reply is dropped
    async fn handle_notification(&self, request: JsonRpcRequest) {
        match request.method.as_str() {
            methods::INITIALIZED => tracing::info!("Agent protocol client initialized"),
            methods::TOOLS_CALL => {
                let response = self.handle_tools_call(None, request.params).await;
                if let Some(error) = response.error {
                    tracing::warn!(error = %error.message, "Rejected tools/call notification");
                }
            }
            other => tracing::debug!(method = other, "Ignoring agent protocol notification"),
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": self.server_name,
                "version": self.server_version
            }
        })
    }

    async fn handle_tools_call(&self, id: Option<RequestId>, params: Option<Value>) -> JsonRpcResponse {
        let Some(params) = params else {
            return JsonRpcResponse::error(id, JsonRpcError::invalid_params("missing params"));
        };
        let params: CallToolParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => return JsonRpcResponse::error(id, JsonRpcError::invalid_params(e.to_string())),
        };

        let result = self
            .call_tool(&params.name, params.arguments.unwrap_or_else(|| json!({})))
            .await;
        match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(_) => JsonRpcResponse::error(id, JsonRpcError::internal_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::AgentError;
    use crate::jsonrpc::codes;

    fn bridge() -> ProtocolBridge {
        let registry = ToolRegistry::new();
        registry
            .register_fn(
                "greet",
                "Greet someone",
                json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"]
                }),
                |args| async move {
                    let name = args["name"].as_str().unwrap_or_default().to_string();
                    Ok(json!({"greeting": format!("Hello, {name}!")}))
                },
            )
            .unwrap();
        registry
            .register_fn("broken", "Always fails", json!({"type": "object"}), |_args| async {
                Err(AgentError::ToolExecution("pool exhausted at db-primary:5432".into()))
            })
            .unwrap();
        ProtocolBridge::new(Arc::new(registry))
    }

    async fn rpc(bridge: &ProtocolBridge, body: Value) -> JsonRpcResponse {
        bridge.handle_value(body).await.unwrap()
    }

    #[test]
    fn test_catalog_mirrors_registry() {
        let catalog = bridge().catalog();
        let names: Vec<&str> = catalog.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["broken", "greet"]);
        assert_eq!(catalog[1].input_schema["required"], json!(["name"]));
    }

    #[tokio::test]
    async fn test_initialize_and_ping() {
        let bridge = bridge();
        let init = rpc(&bridge, json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"})).await;
        let result = init.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "agent-tools");

        let ping = rpc(&bridge, json!({"jsonrpc": "2.0", "id": "p", "method": "ping"})).await;
        assert_eq!(ping.id, Some(RequestId::String("p".into())));
        assert_eq!(ping.result, Some(json!({})));
    }

    #[tokio::test]
    async fn test_tools_list_uses_input_schema_key() {
        let response = rpc(&bridge(), json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"})).await;
        let tools = &response.result.unwrap()["tools"];
        assert_eq!(tools.as_array().unwrap().len(), 2);
        assert!(tools[0].get("inputSchema").is_some());
    }

    #[tokio::test]
    async fn test_tools_call_success() {
        let response = rpc(
            &bridge(),
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "greet", "arguments": {"name": "Ada"}}
            }),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], false);
        assert_eq!(result["structuredContent"]["greeting"], "Hello, Ada!");
        assert_eq!(result["content"][0]["type"], "text");
    }

    #[tokio::test]
    async fn test_tool_failures_are_results_not_errors() {
        let bridge = bridge();
        for params in [
            json!({"name": "broken"}),
            json!({"name": "missing"}),
            json!({"name": "greet", "arguments": {"name": 7}}),
        ] {
            let response = rpc(
                &bridge,
                json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": params}),
            )
            .await;
            assert!(!response.is_error());
            let result = response.result.unwrap();
            assert_eq!(result["isError"], true);
            assert!(!result["content"][0]["text"].as_str().unwrap().contains("db-primary"));
        }
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let bridge = bridge();

        let parse = bridge.handle_message("{not json").await.unwrap();
        assert_eq!(parse.error.unwrap().code, codes::PARSE_ERROR);
        assert_eq!(parse.id, None);

        let unknown = rpc(&bridge, json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"})).await;
        assert_eq!(unknown.error.unwrap().code, codes::METHOD_NOT_FOUND);

        let no_name = rpc(
            &bridge,
            json!({"jsonrpc": "2.0", "id": 6, "method": "tools/call", "params": {}}),
        )
        .await;
        assert_eq!(no_name.error.unwrap().code, codes::INVALID_PARAMS);

        let bad_version = rpc(&bridge, json!({"jsonrpc": "1.0", "id": 7, "method": "ping"})).await;
        assert_eq!(bad_version.error.unwrap().code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let response = bridge()
            .handle_value(json!({"jsonrpc": "2.0", "method": methods::INITIALIZED}))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_tools_call_notification_still_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new();
        let counter = runs.clone();
        registry
            .register_fn("tick", "Count invocations", json!({"type": "object"}), move |_args| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({}))
                }
            })
            .unwrap();
        let bridge = ProtocolBridge::new(Arc::new(registry));

        let response = bridge
            .handle_value(json!({"jsonrpc": "2.0", "method": "tools/call", "params": {"name": "tick"}}))
            .await;
        assert!(response.is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_typed_requests() {
        let bridge = bridge();
        let response = bridge
            .handle_request(JsonRpcRequest::new(RequestId::Number(9), methods::TOOLS_LIST, None))
            .await
            .unwrap();
        assert_eq!(response.id, Some(RequestId::Number(9)));
        assert_eq!(response.result.unwrap()["tools"].as_array().unwrap().len(), 2);
    }
}
