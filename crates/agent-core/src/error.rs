//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
///
/// Tool-level variants (`ToolNotFound`, `InvalidArguments`, `ToolExecution`,
/// `ToolTimeout`) are recoverable: the registry folds them into a failed
/// `ToolInvocation` instead of returning them. Provider variants and
/// `MaxIterations` end the current turn.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Malformed inbound request
    #[error("Validation error: {0}")]
    Validation(String),

    /// A tool with this name is already registered
    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    /// Tool not found in registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Arguments do not match the tool's declared schema
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// Tool handler failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Tool handler exceeded its time budget
    #[error("Tool '{tool}' timed out after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider did not answer in time
    #[error("Provider timed out: {0}")]
    ProviderTimeout(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Maximum reasoning rounds reached in the orchestration loop
    #[error("Maximum iterations ({0}) reached")]
    MaxIterations(usize),

    /// Session storage failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The caller went away
    #[error("Request cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_)
                | Self::ProviderTimeout(_)
                | Self::RateLimited(_)
                | Self::Persistence(_)
                | Self::Io(_)
        )
    }

    /// Whether the error belongs to a single tool invocation rather than the turn
    pub const fn is_tool_level(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound(_)
                | Self::InvalidArguments { .. }
                | Self::ToolExecution(_)
                | Self::ToolTimeout { .. }
        )
    }

    /// Stable machine-readable code for external callers
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::DuplicateTool(_) => "DUPLICATE_TOOL",
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            Self::ToolExecution(_) => "TOOL_EXECUTION_ERROR",
            Self::ToolTimeout { .. } => "TOOL_TIMEOUT",
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::ProviderTimeout(_) => "PROVIDER_TIMEOUT",
            Self::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Auth(_) => "PROVIDER_AUTH_FAILED",
            Self::MaxIterations(_) => "MAX_ITERATIONS_EXCEEDED",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) | Self::Json(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Convert to a user-friendly message
    ///
    /// Never echoes backend payloads; validation and tool messages are the
    /// only ones built from caller-supplied data.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("Invalid request: {msg}"),
            Self::DuplicateTool(name) => format!("A tool named '{name}' is already registered."),
            Self::ToolNotFound(name) => format!("The tool '{name}' is not available."),
            Self::InvalidArguments { tool, reason } => {
                format!("Invalid arguments for tool '{tool}': {reason}")
            }
            Self::ToolExecution(_) => "The tool failed to run.".into(),
            Self::ToolTimeout { tool, .. } => format!("The tool '{tool}' took too long to respond."),
            Self::Provider(_) => "The AI service encountered an error.".into(),
            Self::ProviderTimeout(_) => "The AI service did not respond in time. Please try again.".into(),
            Self::ProviderUnavailable(_) => "The AI service is currently unavailable. Please try again.".into(),
            Self::RateLimited(_) => "You've made too many requests. Please wait a moment.".into(),
            Self::Auth(_) => "The AI service rejected our credentials.".into(),
            Self::MaxIterations(_) => "The request took too many tool rounds to resolve. Please try a simpler query.".into(),
            Self::Persistence(_) => "The conversation could not be saved.".into(),
            Self::Cancelled => "The request was cancelled.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
