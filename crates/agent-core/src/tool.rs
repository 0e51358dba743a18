//! Tool System
//!
//! Extensible tool framework for agent capabilities.
//! Tools are registered into a [`ToolRegistry`] and invoked either by the
//! orchestration loop or, one call at a time, through the protocol bridge.
//! Both paths go through [`ToolRegistry::execute`], so a tool behaves the same
//! regardless of who asked for it.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

/// Default per-invocation time budget
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Tool call request from the LLM (or from an external agent)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id, echoed back on the matching result
    pub id: String,

    /// Tool identifier
    pub name: String,

    /// Arguments as a JSON object
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    json!({})
}

impl ToolCall {
    /// Create a call with a freshly generated correlation id
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Outcome of a single invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Success,
    Error,
}

/// One execution attempt of a tool with concrete arguments
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Correlation id of the originating [`ToolCall`]
    pub call_id: String,

    pub tool_name: String,

    pub arguments: Value,

    pub status: InvocationStatus,

    /// Handler output on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Full error text on failure; only the model sees this
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Failure description safe to show outside callers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_error: Option<String>,

    /// Stable error code on failure (see [`AgentError::code`])
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Wall-clock time spent, including validation
    pub duration_ms: u64,
}

impl ToolInvocation {
    pub fn success(call: &ToolCall, result: Value, duration: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: InvocationStatus::Success,
            result: Some(result),
            error: None,
            public_error: None,
            error_code: None,
            duration_ms: millis(duration),
        }
    }

    pub fn failure(call: &ToolCall, error: &AgentError, duration: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: InvocationStatus::Error,
            result: None,
            error: Some(error.to_string()),
            public_error: Some(error.user_message()),
            error_code: Some(error.code().to_string()),
            duration_ms: millis(duration),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Success
    }

    /// Text fed back to the model as the tool message content
    ///
    /// Plain string results are passed through; structured results are
    /// serialized as JSON. Failures are wrapped so the model can tell them
    /// apart from data.
    pub fn content(&self) -> String {
        match (&self.result, &self.error) {
            (Some(Value::String(text)), _) => text.clone(),
            (Some(value), _) => value.to_string(),
            (None, Some(error)) => json!({ "error": error }).to_string(),
            (None, None) => String::new(),
        }
    }

    /// Like [`ToolInvocation::content`], but failures carry only the
    /// caller-safe message and the error code
    pub fn public_content(&self) -> String {
        if self.is_success() {
            return self.content();
        }
        json!({
            "error": self.public_error.as_deref().unwrap_or("The tool failed to run."),
            "error_code": self.error_code,
        })
        .to_string()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Parameter definition for tool schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type (string, number, integer, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Default value if not provided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ParameterSchema {
    pub fn required(name: impl Into<String>, param_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required: true,
            default: None,
            enum_values: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    fn to_property(&self) -> Value {
        let mut property = json!({
            "type": self.param_type,
            "description": self.description,
        });
        if let Some(default) = &self.default {
            property["default"] = default.clone();
        }
        if let Some(values) = &self.enum_values {
            property["enum"] = Value::Array(values.clone());
        }
        property
    }
}

/// Tool definition schema (for LLM function calling and the agent protocol)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// Parameter definitions
    #[serde(default)]
    pub parameters: Vec<ParameterSchema>,

    /// Hand-written JSON schema, used verbatim instead of `parameters`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_schema: Option<Value>,

    /// Category for grouping
    #[serde(default)]
    pub category: Option<String>,

    /// Whether tool has side effects
    #[serde(default)]
    pub has_side_effects: bool,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            raw_schema: None,
            category: None,
            has_side_effects: false,
        }
    }

    pub fn param(mut self, parameter: ParameterSchema) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn side_effects(mut self) -> Self {
        self.has_side_effects = true;
        self
    }

    /// JSON Schema object describing the accepted arguments
    pub fn input_schema(&self) -> Value {
        if let Some(raw) = &self.raw_schema {
            return raw.clone();
        }

        let properties: serde_json::Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.to_property()))
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for LLM function calling
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with arguments already validated against [`Tool::schema`]
    async fn execute(&self, arguments: &Value) -> Result<Value>;
}

/// Boxed async handler used by closure-registered tools
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct FnTool {
    schema: ToolSchema,
    handler: ToolHandler,
}

#[async_trait]
impl Tool for FnTool {
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn execute(&self, arguments: &Value) -> Result<Value> {
        (self.handler)(arguments.clone()).await
    }
}

#[derive(Clone)]
struct RegisteredTool {
    tool: Arc<dyn Tool>,
    schema: ToolSchema,
    validator: Arc<JSONSchema>,
}

impl RegisteredTool {
    fn validate(&self, arguments: &Value) -> Result<()> {
        if let Err(errors) = self.validator.validate(arguments) {
            let reason = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AgentError::InvalidArguments {
                tool: self.schema.name.clone(),
                reason,
            });
        }
        Ok(())
    }
}

/// Registry for available tools
///
/// Reads take a shared lock only long enough to clone an `Arc`, so concurrent
/// executions never contend with each other. Registration takes the write
/// lock for the duration of the insert.
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Set the per-invocation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a new tool
    pub fn register<T: Tool + 'static>(&self, tool: T) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    /// Register a shared tool
    pub fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let schema = tool.schema();
        if schema.name.trim().is_empty() {
            return Err(AgentError::Validation("tool name must not be empty".into()));
        }

        let input_schema = schema.input_schema();
        let validator = JSONSchema::compile(&input_schema).map_err(|e| {
            AgentError::Config(format!("invalid schema for tool '{}': {e}", schema.name))
        })?;

        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains_key(&schema.name) {
            return Err(AgentError::DuplicateTool(schema.name));
        }

        tracing::debug!(tool = %schema.name, "Registered tool");
        tools.insert(
            schema.name.clone(),
            RegisteredTool {
                tool,
                schema,
                validator: Arc::new(validator),
            },
        );
        Ok(())
    }

    /// Register an async closure as a tool
    pub fn register_fn<F, Fut>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut schema = ToolSchema::new(name, description);
        schema.raw_schema = Some(parameters_schema);
        let handler: ToolHandler = Arc::new(move |args| handler(args).boxed());
        self.register_arc(Arc::new(FnTool { schema, handler }))
    }

    fn entry(&self, name: &str) -> Result<RegisteredTool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))
    }

    /// Look up a tool by name
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.entry(name).map(|e| e.tool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Snapshot of all tool schemas, ordered by name
    pub fn list(&self) -> Vec<ToolSchema> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.schema.clone())
            .collect()
    }

    /// Get tool names
    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Execute a tool call
    ///
    /// Never fails: every fault becomes an invocation with
    /// [`InvocationStatus::Error`].
    pub async fn execute(&self, call: &ToolCall) -> ToolInvocation {
        self.execute_with_cancel(call, &CancellationToken::new()).await
    }

    /// Execute a tool call, abandoning it if `cancel` fires
    ///
    /// Side effects the handler already committed are not rolled back.
    pub async fn execute_with_cancel(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolInvocation {
        let started = Instant::now();
        match self.run(call, cancel).await {
            Ok(result) => {
                tracing::debug!(tool = %call.name, call_id = %call.id, "Tool succeeded");
                ToolInvocation::success(call, result, started.elapsed())
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool failed");
                ToolInvocation::failure(call, &e, started.elapsed())
            }
        }
    }

    async fn run(&self, call: &ToolCall, cancel: &CancellationToken) -> Result<Value> {
        let entry = self.entry(&call.name)?;

        let arguments = if call.arguments.is_null() {
            empty_object()
        } else {
            call.arguments.clone()
        };
        entry.validate(&arguments)?;

        let guarded = AssertUnwindSafe(entry.tool.execute(&arguments)).catch_unwind();

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AgentError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, guarded) => match outcome {
                Err(_) => Err(AgentError::ToolTimeout {
                    tool: call.name.clone(),
                    secs: self.timeout.as_secs(),
                }),
                Ok(Err(panic)) => Err(AgentError::ToolExecution(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
                Ok(Ok(Err(e))) if e.is_tool_level() => Err(e),
                Ok(Ok(Err(e))) => Err(AgentError::ToolExecution(e.to_string())),
                Ok(Ok(Ok(value))) => Ok(value),
            },
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
