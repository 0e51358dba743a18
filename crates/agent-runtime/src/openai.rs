//! OpenAI-compatible LLM Provider
//!
//! Implementation of `LlmProvider` for any `/chat/completions` endpoint with
//! function calling: Qwen (DashScope compatible mode), OpenAI, or a local
//! Ollama server through its `/v1` API.

use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{Completion, FinishReason, GenerationOptions, LlmProvider, ModelInfo, ProviderReply, TokenUsage},
    tool::{ToolCall, ToolSchema},
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const DEFAULT_API_BASE: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_MODEL: &str = "qwen-max";

/// Provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Base URL up to and including the version segment
    pub api_base: String,

    /// Bearer token; local servers usually need none
    pub api_key: Option<String>,

    /// Model used when the request does not name one
    pub default_model: String,

    /// Whole-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.into(),
            api_key: None,
            default_model: DEFAULT_MODEL.into(),
            timeout_secs: 60,
        }
    }
}

impl OpenAiConfig {
    /// Read `LLM_API_BASE`, `LLM_API_KEY` (or `QWEN_API_KEY`), `LLM_MODEL`
    /// and `LLM_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("QWEN_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        let timeout_secs = std::env::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| match v.parse() {
                Ok(secs) => Some(secs),
                Err(_) => {
                    tracing::warn!(value = %v, "Invalid LLM_TIMEOUT_SECS, using default");
                    None
                }
            })
            .unwrap_or(defaults.timeout_secs);

        Self {
            api_base: std::env::var("LLM_API_BASE").unwrap_or(defaults.api_base),
            api_key,
            default_model: std::env::var("LLM_MODEL").unwrap_or(defaults.default_model),
            timeout_secs,
        }
    }
}

/// OpenAI-compatible chat-completions provider
pub struct OpenAiCompatProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiCompatProvider {
    /// Create from configuration
    pub fn from_config(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(OpenAiConfig::from_env())
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.api_base.trim_end_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn model<'a>(&'a self, options: &'a GenerationOptions) -> &'a str {
        if options.model.is_empty() {
            &self.config.default_model
        } else {
            &options.model
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

fn function_kind() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// A JSON-encoded string on the wire; some servers send an object
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
}

fn convert_message(message: &Message) -> WireMessage {
    let content = if message.requests_tools() && message.content.is_empty() {
        None
    } else {
        Some(message.content.clone())
    };
    WireMessage {
        role: message.role.to_string(),
        content,
        name: None,
        tool_calls: message
            .tool_calls
            .iter()
            .map(|call| WireToolCall {
                id: call.id.clone(),
                kind: function_kind(),
                function: WireFunction {
                    name: call.name.clone(),
                    arguments: Value::String(call.arguments.to_string()),
                },
            })
            .collect(),
        tool_call_id: (message.role == Role::Tool)
            .then(|| message.tool_call_id.clone())
            .flatten(),
    }
}

fn convert_tool(schema: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": schema.name,
            "description": schema.description,
            "parameters": schema.input_schema(),
        }
    })
}

fn build_request_body(context: &[Message], tools: &[ToolSchema], model: &str, options: &GenerationOptions) -> Value {
    let mut body = json!({
        "model": model,
        "messages": context.iter().map(convert_message).collect::<Vec<_>>(),
        "temperature": options.temperature,
        "max_tokens": options.max_tokens,
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.iter().map(convert_tool).collect());
        body["tool_choice"] = json!("auto");
    }
    if let Some(top_p) = options.top_p {
        body["top_p"] = json!(top_p);
    }
    if !options.stop_sequences.is_empty() {
        body["stop"] = json!(options.stop_sequences);
    }
    body
}

/// Undecodable arguments are passed through as the raw string so the
/// registry's schema check reports them as a tool-level error.
fn decode_arguments(arguments: Value) -> Value {
    match arguments {
        Value::String(raw) if raw.trim().is_empty() => json!({}),
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        Value::Null => json!({}),
        other => other,
    }
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn parse_response(response: ChatResponse, requested_model: &str) -> Result<Completion> {
    let model = response.model.unwrap_or_else(|| requested_model.to_string());
    let usage = response
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Provider("response contained no choices".into()))?;

    let text = choice.message.content.unwrap_or_default();
    let reply = if choice.message.tool_calls.is_empty() {
        ProviderReply::FinalAnswer { text }
    } else {
        let calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let parsed = ToolCall::new(call.function.name, decode_arguments(call.function.arguments));
                if call.id.is_empty() { parsed } else { parsed.with_id(call.id) }
            })
            .collect();
        ProviderReply::ToolCallsRequested {
            text: Some(text).filter(|t| !t.trim().is_empty()),
            calls,
        }
    };

    Ok(Completion {
        reply,
        model,
        usage,
        finish_reason: choice.finish_reason.as_deref().map(parse_finish_reason),
    })
}

fn map_http_error(status: StatusCode, body: &str) -> AgentError {
    let detail = format!("HTTP {status}: {}", body.chars().take(500).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AgentError::ProviderTimeout(detail),
        s if s.is_server_error() => AgentError::ProviderUnavailable(detail),
        _ => AgentError::Provider(detail),
    }
}

fn map_transport_error(err: &reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::ProviderTimeout(err.to_string())
    } else if err.is_connect() {
        AgentError::ProviderUnavailable(err.to_string())
    } else {
        AgentError::Provider(err.to_string())
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    async fn health_check(&self) -> Result<bool> {
        match self.list_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "LLM health check failed");
                Ok(false)
            }
        }
    }

    async fn send(
        &self,
        context: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let model = self.model(options);
        let body = build_request_body(context, tools, model, options);
        tracing::debug!(model, messages = context.len(), tools = tools.len(), "Sending chat completion");

        let response = self
            .authorized(self.client.post(self.url("chat/completions")))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("malformed completion response: {e}")))?;
        parse_response(parsed, model)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .authorized(self.client.get(self.url("models")))
            .send()
            .await
            .map_err(|e| map_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &text));
        }

        let models: ModelList = response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("malformed model list: {e}")))?;
        Ok(models
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                owned_by: m.owned_by,
            })
            .collect())
    }
}
