//! Orchestration Loop
//!
//! Drives one conversational turn as a small state machine:
//!
//! ```text
//! Idle → AwaitingLlm → FinalAnswer ─────────────────────────→ Persisted
//!              ↑     ↘ ToolCallsRequested → ExecutingTools ─┐
//!              └─────────────────────────────────────────────┘
//! ```
//!
//! Turns on the same session are serialized by [`SessionLocks`]; turns on
//! different sessions run fully in parallel. Tool faults are folded back into
//! the conversation; provider faults, cancellation and the round bound end
//! the turn without persisting anything.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};
use crate::message::{Conversation, Message};
use crate::provider::{
    Completion, ExchangeStatus, GenerationOptions, LlmExchangeRecord, LlmProvider, ProviderReply, TokenUsage,
};
use crate::session::{MemorySessionStore, Session, SessionId, SessionLocks, SessionStore};
use crate::tool::{InvocationStatus, ToolCall, ToolInvocation, ToolRegistry};

/// Default bound on LLM rounds per turn
pub const DEFAULT_MAX_ITERATIONS: usize = 5;

/// Default number of stored messages sent as context
pub const DEFAULT_MAX_HISTORY_MESSAGES: usize = 10;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. \
Use the available tools when they help answer the user's question and answer directly when they do not. \
After receiving tool results, synthesize them into a concise, accurate response.";

/// Orchestrator configuration
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Prompt used when neither the request nor the session carries one
    pub default_system_prompt: Option<String>,

    /// Maximum LLM rounds before giving up
    pub max_iterations: usize,

    /// Stored messages sent as context (0 sends all)
    pub max_history_messages: usize,

    /// Generation defaults; requests may override temperature and max tokens
    pub generation: GenerationOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_system_prompt: Some(DEFAULT_SYSTEM_PROMPT.into()),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_history_messages: DEFAULT_MAX_HISTORY_MESSAGES,
            generation: GenerationOptions::default(),
        }
    }
}

/// Primary inbound request
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    pub query: String,

    /// Generated when absent
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl TurnRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Reject malformed requests before any orchestration starts
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(AgentError::Validation("query must not be empty".into()));
        }
        if self.session_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(AgentError::Validation("session_id must not be blank".into()));
        }
        if let Some(t) = self.temperature.filter(|t| !(0.0..=2.0).contains(t)) {
            return Err(AgentError::Validation(format!(
                "temperature must be between 0 and 2, got {t}"
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(AgentError::Validation("max_tokens must be positive".into()));
        }
        Ok(())
    }
}

/// One entry of `tools_called`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub name: String,
    pub arguments: Value,
    pub call_id: String,
    pub status: InvocationStatus,
    /// Caller-safe message; the model sees the full error in the transcript
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub duration_ms: u64,
}

impl From<&ToolInvocation> for ToolCallSummary {
    fn from(invocation: &ToolInvocation) -> Self {
        Self {
            name: invocation.tool_name.clone(),
            arguments: invocation.arguments.clone(),
            call_id: invocation.call_id.clone(),
            status: invocation.status,
            error: invocation.public_error.clone(),
            error_code: invocation.error_code.clone(),
            duration_ms: invocation.duration_ms,
        }
    }
}

/// Result of a completed turn
#[derive(Clone, Debug, Serialize)]
pub struct TurnOutcome {
    pub session_id: SessionId,
    pub response_text: String,
    pub model_used: String,
    pub tools_called: Vec<ToolCallSummary>,
    pub usage: TokenUsage,
    /// LLM rounds used
    pub rounds: usize,
    /// Messages this turn appended, in order
    pub transcript: Vec<Message>,
    pub exchanges: Vec<LlmExchangeRecord>,
    /// Set when the answer could not be stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_warning: Option<String>,
}

/// A turn that ended without an answer
///
/// Nothing from a failed turn is persisted; whatever was produced so far is
/// handed back in `partial_transcript`.
#[derive(Debug, Error)]
#[error("turn failed for session {session_id}: {error}")]
pub struct TurnFailure {
    #[source]
    pub error: AgentError,
    pub session_id: SessionId,
    pub partial_transcript: Vec<Message>,
    pub tools_called: Vec<ToolCallSummary>,
}

/// Orchestration state, logged on every transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingLlm { round: usize },
    ExecutingTools { round: usize, calls: usize },
    FinalAnswer { round: usize },
    Persisted,
}

fn transition(session_id: &SessionId, state: TurnState) {
    debug!(session_id = %session_id, state = ?state, "Turn state");
}

/// Everything a turn accumulates before it is persisted or abandoned
struct TurnRecord {
    session_id: SessionId,
    transcript: Vec<Message>,
    tools_called: Vec<ToolCallSummary>,
    exchanges: Vec<LlmExchangeRecord>,
    usage: TokenUsage,
    rounds: usize,
    model_used: String,
}

impl TurnRecord {
    fn new(session_id: SessionId, model: &str) -> Self {
        Self {
            session_id,
            transcript: Vec::new(),
            tools_called: Vec::new(),
            exchanges: Vec::new(),
            usage: TokenUsage::default(),
            rounds: 0,
            model_used: model.to_string(),
        }
    }

    fn record(&mut self, conversation: &mut Conversation, message: Message) {
        conversation.push(message.clone());
        self.transcript.push(message);
    }

    fn fail(self, error: AgentError) -> TurnFailure {
        TurnFailure {
            error,
            session_id: self.session_id,
            partial_transcript: self.transcript,
            tools_called: self.tools_called,
        }
    }
}

/// The tool-calling orchestrator
pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn SessionStore>,
    locks: SessionLocks,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn SessionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            locks: SessionLocks::new(),
            config,
        }
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Run one conversational turn
    ///
    /// `cancel` is passed through to the provider call and every tool call;
    /// work already committed by a tool is not rolled back.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<TurnOutcome, TurnFailure> {
        let session_id = request
            .session_id
            .as_deref()
            .map_or_else(SessionId::new, SessionId::from);
        let mut turn = TurnRecord::new(session_id.clone(), &self.config.generation.model);

        if let Err(e) = request.validate() {
            return Err(turn.fail(e));
        }

        transition(&session_id, TurnState::Idle);
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(turn.fail(AgentError::Cancelled)),
            guard = self.locks.acquire(&session_id) => guard,
        };

        let started = Instant::now();
        let response_text = match self.drive(&request, &mut turn, &cancel).await {
            Ok(text) => text,
            Err(e) => {
                error!(
                    session_id = %session_id,
                    rounds = turn.rounds,
                    error_code = e.code(),
                    error = %e,
                    "Turn failed"
                );
                return Err(turn.fail(e));
            }
        };

        let persistence_warning = self.persist(&session_id, &turn.transcript).await;

        info!(
            session_id = %session_id,
            rounds = turn.rounds,
            tools_called = turn.tools_called.len(),
            latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Turn completed"
        );

        Ok(TurnOutcome {
            session_id,
            response_text,
            model_used: turn.model_used,
            tools_called: turn.tools_called,
            usage: turn.usage,
            rounds: turn.rounds,
            transcript: turn.transcript,
            exchanges: turn.exchanges,
            persistence_warning,
        })
    }

    async fn drive(&self, request: &TurnRequest, turn: &mut TurnRecord, cancel: &CancellationToken) -> Result<String> {
        let session = self.store.get(&turn.session_id).await?;
        let system_prompt = self
            .resolve_system_prompt(&session, request.system_prompt.as_deref())
            .await;

        let mut conversation = Conversation::from_history(
            system_prompt.as_deref(),
            &session.messages,
            self.config.max_history_messages,
        );
        turn.record(&mut conversation, Message::user(&request.query));

        let options = self.generation_options(request);
        let catalog = self.tools.list();

        for round in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            transition(&turn.session_id, TurnState::AwaitingLlm { round });

            let started = Instant::now();
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(AgentError::Cancelled),
                result = self.provider.send(conversation.messages(), &catalog, &options) => result,
            };
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            turn.rounds = round;

            let mut exchange = LlmExchangeRecord {
                provider: self.provider.name().to_string(),
                model: options.model.clone(),
                round,
                request_messages: conversation.len(),
                tools_offered: catalog.len(),
                status: ExchangeStatus::Failed,
                tool_calls: None,
                usage: None,
                latency_ms,
                error: None,
            };

            let Completion { reply, model, usage, .. } = match sent {
                Ok(completion) => completion,
                Err(e) => {
                    exchange.error = Some(e.to_string());
                    debug!(exchange = ?exchange, "LLM exchange");
                    turn.exchanges.push(exchange);
                    return Err(e);
                }
            };

            if let Some(usage) = &usage {
                turn.usage.accumulate(usage);
            }
            exchange.model.clone_from(&model);
            exchange.usage = usage;
            turn.model_used.clone_from(&model);

            let (text, calls) = match reply {
                ProviderReply::FinalAnswer { text } => (text, Vec::new()),
                ProviderReply::ToolCallsRequested { text, calls } => (text.unwrap_or_default(), calls),
            };

            if calls.is_empty() {
                exchange.status = ExchangeStatus::FinalAnswer;
                debug!(exchange = ?exchange, "LLM exchange");
                turn.exchanges.push(exchange);

                transition(&turn.session_id, TurnState::FinalAnswer { round });
                turn.record(&mut conversation, Message::assistant(&text).with_model(&model));
                return Ok(text);
            }

            exchange.status = ExchangeStatus::ToolCalls;
            exchange.tool_calls = Some(calls.len());
            debug!(exchange = ?exchange, "LLM exchange");
            turn.exchanges.push(exchange);

            // Results are matched by id, so every call needs one.
            let calls: Vec<ToolCall> = calls
                .into_iter()
                .map(|c| if c.id.is_empty() { ToolCall::new(c.name, c.arguments) } else { c })
                .collect();

            transition(
                &turn.session_id,
                TurnState::ExecutingTools {
                    round,
                    calls: calls.len(),
                },
            );
            turn.record(
                &mut conversation,
                Message::assistant_tool_calls(text, calls.clone()).with_model(&model),
            );

            let invocations = join_all(calls.iter().map(|call| {
                info!(session_id = %turn.session_id, tool = %call.name, call_id = %call.id, round, "Executing tool");
                self.tools.execute_with_cancel(call, cancel)
            }))
            .await;

            for invocation in invocations {
                turn.tools_called.push(ToolCallSummary::from(&invocation));
                turn.record(&mut conversation, Message::tool_result(invocation));
            }
        }

        warn!(
            session_id = %turn.session_id,
            max_iterations = self.config.max_iterations,
            "Tool loop did not converge"
        );
        Err(AgentError::MaxIterations(self.config.max_iterations))
    }

    async fn resolve_system_prompt(&self, session: &Session, requested: Option<&str>) -> Option<String> {
        match requested.map(str::trim).filter(|p| !p.is_empty()) {
            Some(prompt) if session.system_prompt.as_deref() != Some(prompt) => {
                if let Err(e) = self
                    .store
                    .set_system_prompt(&session.id, Some(prompt.to_string()))
                    .await
                {
                    warn!(session_id = %session.id, error = %e, "Could not store system prompt");
                }
                Some(prompt.to_string())
            }
            _ => session
                .system_prompt
                .clone()
                .or_else(|| self.config.default_system_prompt.clone()),
        }
    }

    fn generation_options(&self, request: &TurnRequest) -> GenerationOptions {
        let mut options = self.config.generation.clone();
        if let Some(temperature) = request.temperature {
            options.temperature = temperature;
        }
        if let Some(max_tokens) = request.max_tokens {
            options.max_tokens = max_tokens;
        }
        options
    }

    /// Append the turn, retrying once; returns a warning if both attempts fail
    async fn persist(&self, session_id: &SessionId, messages: &[Message]) -> Option<String> {
        let first = match self.store.append_all(session_id, messages.to_vec()).await {
            Ok(()) => {
                transition(session_id, TurnState::Persisted);
                return None;
            }
            Err(e) => e,
        };
        warn!(session_id = %session_id, error = %first, "Persisting turn failed, retrying once");

        match self.store.append_all(session_id, messages.to_vec()).await {
            Ok(()) => {
                transition(session_id, TurnState::Persisted);
                None
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Turn answered but not persisted");
                Some(e.user_message())
            }
        }
    }

    /// Stored session, created if unknown
    pub async fn history(&self, session_id: &SessionId) -> Result<Session> {
        self.store.get(session_id).await
    }

    /// Wipe a session's history, waiting for any turn in flight
    pub async fn clear_session(&self, session_id: &SessionId) -> Result<()> {
        let _guard = self.locks.acquire(session_id).await;
        self.store.clear(session_id).await?;
        info!(session_id = %session_id, "Session cleared");
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        self.store.list_ids().await
    }

    /// Sessions with a turn running or queued
    pub fn active_sessions(&self) -> usize {
        self.locks.active()
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: Option<Arc<ToolRegistry>>,
    store: Option<Arc<dyn SessionStore>>,
    config: OrchestratorConfig,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: None,
            store: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.default_system_prompt = Some(prompt.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn max_history_messages(mut self, max: usize) -> Self {
        self.config.max_history_messages = max;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }

        Ok(Orchestrator::new(
            provider,
            self.tools.unwrap_or_default(),
            self.store
                .unwrap_or_else(|| Arc::new(MemorySessionStore::new())),
            self.config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::message::Role;
    use crate::provider::ModelInfo;
    use crate::tool::ToolSchema;

    type Script = Box<dyn Fn(&[Message], usize) -> Result<Completion> + Send + Sync>;

    /// Provider double answering from a closure of (context, call index)
    struct ScriptedProvider {
        script: Script,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(script: impl Fn(&[Message], usize) -> Result<Completion> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn send(
            &self,
            context: &[Message],
            _tools: &[ToolSchema],
            _options: &GenerationOptions,
        ) -> Result<Completion> {
            tokio::task::yield_now().await;
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.script)(context, n)
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Ok(Vec::new())
        }
    }

    /// Store whose first `failures` appends fail
    struct FlakyStore {
        inner: MemorySessionStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn get(&self, id: &SessionId) -> Result<Session> {
            self.inner.get(id).await
        }

        async fn append_all(&self, id: &SessionId, messages: Vec<Message>) -> Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AgentError::Persistence("disk full".into()));
            }
            self.inner.append_all(id, messages).await
        }

        async fn clear(&self, id: &SessionId) -> Result<()> {
            self.inner.clear(id).await
        }

        async fn set_system_prompt(&self, id: &SessionId, prompt: Option<String>) -> Result<()> {
            self.inner.set_system_prompt(id, prompt).await
        }

        async fn list_ids(&self) -> Result<Vec<SessionId>> {
            self.inner.list_ids().await
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let registry = ToolRegistry::new();
        registry
            .register_fn(
                "add",
                "Add two integers",
                json!({
                    "type": "object",
                    "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                    "required": ["a", "b"]
                }),
                |args| async move {
                    let a = args["a"].as_i64().unwrap_or_default();
                    let b = args["b"].as_i64().unwrap_or_default();
                    // Larger first operand finishes later.
                    tokio::time::sleep(Duration::from_millis(u64::try_from(a).unwrap_or(0))).await;
                    Ok(json!({"sum": a + b}))
                },
            )
            .unwrap();
        registry
            .register_fn("fail", "Always fails", json!({"type": "object"}), |_args| async {
                Err(AgentError::ToolExecution("backend offline".into()))
            })
            .unwrap();
        Arc::new(registry)
    }

    fn orchestrator(provider: Arc<ScriptedProvider>, store: Arc<dyn SessionStore>) -> Orchestrator {
        Orchestrator::builder()
            .provider(provider)
            .tools(registry())
            .store(store)
            .max_iterations(3)
            .build()
            .unwrap()
    }

    fn call(name: &str, id: &str, args: Value) -> ToolCall {
        ToolCall::new(name, args).with_id(id)
    }

    #[tokio::test]
    async fn test_final_answer_is_persisted() {
        let provider = ScriptedProvider::new(|_, _| Ok(Completion::final_answer("hello there", "test-model")));
        let store = Arc::new(MemorySessionStore::new());
        let orch = orchestrator(provider, store.clone());

        let outcome = orch
            .run_turn(TurnRequest::new("hi").session("s1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.response_text, "hello there");
        assert_eq!(outcome.model_used, "test-model");
        assert_eq!(outcome.rounds, 1);
        assert!(outcome.tools_called.is_empty());
        assert!(outcome.persistence_warning.is_none());

        let roles: Vec<Role> = store
            .get(&"s1".into())
            .await
            .unwrap()
            .messages
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_parallel_tool_results_keep_request_order() {
        let provider = ScriptedProvider::new(|context, n| {
            if n == 0 {
                return Ok(Completion::tool_calls(
                    vec![
                        call("add", "first", json!({"a": 20, "b": 1})),
                        call("add", "second", json!({"a": 1, "b": 2})),
                    ],
                    "m",
                ));
            }
            let results: Vec<&str> = context
                .iter()
                .filter(|m| m.role == Role::Tool)
                .map(|m| m.content.as_str())
                .collect();
            Ok(Completion::final_answer(results.join(","), "m"))
        });
        let store = Arc::new(MemorySessionStore::new());
        let orch = orchestrator(provider, store.clone());

        let outcome = orch
            .run_turn(TurnRequest::new("sum things").session("s2"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.response_text, r#"{"sum":21},{"sum":3}"#);
        let ids: Vec<&str> = outcome.tools_called.iter().map(|t| t.call_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);

        let stored = store.get(&"s2".into()).await.unwrap().messages;
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[2].tool_call_id.as_deref(), Some("first"));
        assert_eq!(stored[3].tool_call_id.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_tool_error_does_not_fail_turn() {
        let provider = ScriptedProvider::new(|_, n| {
            Ok(if n == 0 {
                Completion::tool_calls(vec![call("fail", "f1", json!({}))], "m")
            } else {
                Completion::final_answer("The backend is offline.", "m")
            })
        });
        let orch = orchestrator(provider, Arc::new(MemorySessionStore::new()));

        let outcome = orch
            .run_turn(TurnRequest::new("try it"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.tools_called.len(), 1);
        assert_eq!(outcome.tools_called[0].status, InvocationStatus::Error);
        assert_eq!(outcome.response_text, "The backend is offline.");
    }

    #[tokio::test]
    async fn test_endless_tool_requests_hit_iteration_bound() {
        let provider = ScriptedProvider::new(|_, n| {
            Ok(Completion::tool_calls(
                vec![call("add", &format!("c{n}"), json!({"a": 0, "b": 1}))],
                "m",
            ))
        });
        let store = Arc::new(MemorySessionStore::new());
        let orch = orchestrator(provider.clone(), store.clone());

        let failure = orch
            .run_turn(TurnRequest::new("loop").session("s3"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, AgentError::MaxIterations(3)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        // user + 3 x (assistant request + tool result)
        assert_eq!(failure.partial_transcript.len(), 7);
        assert_eq!(failure.tools_called.len(), 3);
        assert!(store.get(&"s3".into()).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_aborts_without_persisting() {
        let provider = ScriptedProvider::new(|_, _| Err(AgentError::ProviderTimeout("no answer".into())));
        let store = Arc::new(MemorySessionStore::new());
        let orch = orchestrator(provider, store.clone());

        let failure = orch
            .run_turn(TurnRequest::new("hello").session("s4"), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.error.code(), "PROVIDER_TIMEOUT");
        assert_eq!(failure.partial_transcript.len(), 1);
        assert!(store.get(&"s4".into()).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_is_retried_once() {
        let provider = ScriptedProvider::new(|_, _| Ok(Completion::final_answer("ok", "m")));
        let store = Arc::new(FlakyStore {
            inner: MemorySessionStore::new(),
            failures: AtomicUsize::new(1),
        });
        let orch = orchestrator(provider, store.clone());

        let outcome = orch
            .run_turn(TurnRequest::new("hi").session("s5"), CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.persistence_warning.is_none());
        assert_eq!(store.get(&"s5".into()).await.unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_answer_survives_persistent_storage_fault() {
        let provider = ScriptedProvider::new(|_, _| Ok(Completion::final_answer("still here", "m")));
        let store = Arc::new(FlakyStore {
            inner: MemorySessionStore::new(),
            failures: AtomicUsize::new(2),
        });
        let orch = orchestrator(provider, store.clone());

        let outcome = orch
            .run_turn(TurnRequest::new("hi").session("s6"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.response_text, "still here");
        assert!(outcome.persistence_warning.is_some());
        assert!(store.get(&"s6".into()).await.unwrap().messages.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_turns_on_one_session_do_not_interleave() {
        let provider = ScriptedProvider::new(|context, _| {
            let last = context.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(Completion::final_answer(format!("ack {last}"), "m"))
        });
        let store = Arc::new(MemorySessionStore::new());
        let orch = Arc::new(orchestrator(provider, store.clone()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let orch = orch.clone();
                tokio::spawn(async move {
                    orch.run_turn(TurnRequest::new(format!("q{i}")).session("shared"), CancellationToken::new())
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let messages = store.get(&"shared".into()).await.unwrap().messages;
        assert_eq!(messages.len(), 16);
        for pair in messages.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].content, format!("ack {}", pair[0].content));
        }
    }

    #[tokio::test]
    async fn test_cancelled_turn_is_not_persisted() {
        let provider = ScriptedProvider::new(|_, _| Ok(Completion::final_answer("late", "m")));
        let store = Arc::new(MemorySessionStore::new());
        let orch = orchestrator(provider, store.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let failure = orch
            .run_turn(TurnRequest::new("hi").session("s7"), cancel)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, AgentError::Cancelled));
        assert!(store.get(&"s7".into()).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_request_system_prompt_replaces_stored_one() {
        let provider = ScriptedProvider::new(|context, _| {
            assert_eq!(context[0].role, Role::System);
            Ok(Completion::final_answer(context[0].content.clone(), "m"))
        });
        let store = Arc::new(MemorySessionStore::new());
        let orch = orchestrator(provider, store.clone());

        let first = orch
            .run_turn(
                TurnRequest::new("ahoy").session("s8").system_prompt("Talk like a pirate."),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let second = orch
            .run_turn(TurnRequest::new("again").session("s8"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first.response_text, "Talk like a pirate.");
        assert_eq!(second.response_text, "Talk like a pirate.");
        assert_eq!(
            store.get(&"s8".into()).await.unwrap().system_prompt.as_deref(),
            Some("Talk like a pirate.")
        );
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let provider = ScriptedProvider::new(|_, _| Ok(Completion::final_answer("unused", "m")));
        let orch = orchestrator(provider.clone(), Arc::new(MemorySessionStore::new()));

        let failure = orch
            .run_turn(TurnRequest::new("   "), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.error.code(), "VALIDATION_ERROR");

        let mut hot = TurnRequest::new("hi");
        hot.temperature = Some(3.5);
        assert!(hot.validate().is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
