//! HTTP Handlers

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use agent_core::{
    provider::ModelInfo, AgentError, CallToolResult, CancellationToken, Message, SessionId, ToolCallSummary,
    ToolDescriptor, TokenUsage, TurnFailure, TurnOutcome, TurnRequest,
};

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider: String,
    pub provider_connected: bool,
    pub tools: usize,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct LlmWithToolsResponse {
    pub success: bool,
    pub response_text: String,
    pub session_id: SessionId,
    pub model_used: String,
    pub tools_called: Vec<ToolCallSummary>,
    pub usage: TokenUsage,
    pub rounds: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_warning: Option<String>,
}

impl From<TurnOutcome> for LlmWithToolsResponse {
    fn from(outcome: TurnOutcome) -> Self {
        Self {
            success: true,
            response_text: outcome.response_text,
            session_id: outcome.session_id,
            model_used: outcome.model_used,
            tools_called: outcome.tools_called,
            usage: outcome.usage,
            rounds: outcome.rounds,
            persistence_warning: outcome.persistence_warning,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools_called: Vec<ToolCallSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub partial_transcript: Vec<Message>,
}

impl ErrorResponse {
    fn new(error_code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            error_code: error_code.into(),
            session_id: None,
            tools_called: Vec::new(),
            partial_transcript: Vec::new(),
        }
    }
}

impl From<&AgentError> for ErrorResponse {
    fn from(err: &AgentError) -> Self {
        Self::new(err.code(), err.user_message())
    }
}

impl From<TurnFailure> for ErrorResponse {
    fn from(failure: TurnFailure) -> Self {
        let mut response = Self::from(&failure.error);
        response.session_id = Some(failure.session_id);
        response.tools_called = failure.tools_called;
        if matches!(failure.error, AgentError::MaxIterations(_)) {
            response.partial_transcript = failure.partial_transcript;
        }
        response
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn status_for(err: &AgentError) -> StatusCode {
    match err {
        AgentError::Validation(_) => StatusCode::BAD_REQUEST,
        AgentError::Provider(_)
        | AgentError::ProviderUnavailable(_)
        | AgentError::RateLimited(_)
        | AgentError::Auth(_) => StatusCode::BAD_GATEWAY,
        AgentError::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        AgentError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: &AgentError) -> ApiError {
    (status_for(err), Json(ErrorResponse::from(err)))
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionId>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionHistoryResponse {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionClearedResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ToolListResponse {
    pub count: usize,
    pub tools: Vec<ToolInfo>,
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub tools: Vec<ToolDescriptor>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

fn empty_arguments() -> Value {
    json!({})
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider = state.orchestrator.provider();
    let provider_connected = provider.health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        provider: provider.name().to_string(),
        provider_connected,
        tools: state.orchestrator.tools().len(),
        active_sessions: state.orchestrator.active_sessions(),
    })
}

/// Models offered by the configured provider
pub async fn list_models(State(state): State<AppState>) -> Result<Json<ModelsResponse>, ApiError> {
    let models = state.orchestrator.provider().list_models().await.map_err(|e| {
        tracing::warn!(error = %e, "Failed to list models");
        api_error(&e)
    })?;

    Ok(Json(ModelsResponse {
        count: models.len(),
        models,
    }))
}

/// Primary request: one conversational turn with tool calling
///
/// The turn runs in its own task. Dropping this handler (client disconnect)
/// or hitting the request timeout cancels it cooperatively.
pub async fn llm_with_tools(
    State(state): State<AppState>,
    payload: Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Json<LlmWithToolsResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        let err = AgentError::Validation(rejection.body_text());
        api_error(&err)
    })?;
    request.validate().map_err(|e| api_error(&e))?;

    tracing::info!(
        session_id = request.session_id.as_deref().unwrap_or("<new>"),
        query_len = request.query.len(),
        "Received turn request"
    );

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let orchestrator = state.orchestrator.clone();
    let task_cancel = cancel.clone();
    let turn = tokio::spawn(async move { orchestrator.run_turn(request, task_cancel).await });

    match tokio::time::timeout(state.request_timeout, turn).await {
        Ok(Ok(Ok(outcome))) => Ok(Json(outcome.into())),
        Ok(Ok(Err(failure))) => {
            let status = status_for(&failure.error);
            Err((status, Json(failure.into())))
        }
        Ok(Err(join_error)) => {
            tracing::error!(error = %join_error, "Turn task aborted");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("INTERNAL_ERROR", "An unexpected error occurred.")),
            ))
        }
        Err(_elapsed) => {
            cancel.cancel();
            tracing::warn!(timeout_secs = state.request_timeout.as_secs(), "Turn exceeded request timeout");
            Err((
                StatusCode::GATEWAY_TIMEOUT,
                Json(ErrorResponse::new(
                    "REQUEST_TIMEOUT",
                    "The request took too long to complete. Please try again.",
                )),
            ))
        }
    }
}

pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = state.orchestrator.list_sessions().await.map_err(|e| api_error(&e))?;
    Ok(Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    }))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionHistoryResponse>, ApiError> {
    let session = state
        .orchestrator
        .history(&SessionId::from_string(id))
        .await
        .map_err(|e| api_error(&e))?;

    Ok(Json(SessionHistoryResponse {
        session_id: session.id,
        system_prompt: session.system_prompt,
        count: session.messages.len(),
        messages: session.messages,
    }))
}

pub async fn clear_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionClearedResponse>, ApiError> {
    let session_id = SessionId::from_string(id);
    state
        .orchestrator
        .clear_session(&session_id)
        .await
        .map_err(|e| api_error(&e))?;

    Ok(Json(SessionClearedResponse {
        success: true,
        message: format!("Session {session_id} cleared"),
    }))
}

/// Tool catalog introspection
pub async fn list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    let tools: Vec<ToolInfo> = state
        .orchestrator
        .tools()
        .list()
        .into_iter()
        .map(|schema| ToolInfo {
            parameters_schema: schema.input_schema(),
            name: schema.name,
            description: schema.description,
            category: schema.category,
        })
        .collect();

    Json(ToolListResponse {
        count: tools.len(),
        tools,
    })
}

// ============================================================================
// Agent Protocol
// ============================================================================

/// Catalog in the agent protocol's shape
pub async fn protocol_catalog(State(state): State<AppState>) -> Json<CatalogResponse> {
    let tools = state.bridge.catalog();
    Json(CatalogResponse {
        count: tools.len(),
        tools,
    })
}

/// Single tool invocation without the JSON-RPC envelope
pub async fn protocol_call(
    State(state): State<AppState>,
    Json(request): Json<ToolCallRequest>,
) -> Json<CallToolResult> {
    Json(state.bridge.call_tool(&request.name, request.arguments).await)
}

/// JSON-RPC endpoint; notifications are acknowledged with 202 and no body
pub async fn protocol_rpc(State(state): State<AppState>, body: Bytes) -> Response {
    let raw = String::from_utf8_lossy(&body);
    match state.bridge.handle_message(&raw).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}
