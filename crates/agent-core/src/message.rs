//! Conversation Messages
//!
//! Standard message format used across the agent system, plus the context
//! assembly that turns a stored transcript into what the model gets to see.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolInvocation};

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result (injected as context)
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// A single message in a conversation
///
/// Messages are immutable once appended to a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text content
    pub content: String,

    /// Tool name (for tool messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Calls requested by an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Correlation id of the call this tool message answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Full record of the invocation behind a tool message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation: Option<ToolInvocation>,

    /// Model that produced an assistant message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            invocation: None,
            model: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant turn that requests tool calls
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.tool_calls = calls;
        msg
    }

    /// Create a tool result message from an invocation
    pub fn tool_result(invocation: ToolInvocation) -> Self {
        let mut msg = Self::new(Role::Tool, invocation.content());
        msg.name = Some(invocation.tool_name.clone());
        msg.tool_call_id = Some(invocation.call_id.clone());
        msg.invocation = Some(invocation);
        msg
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Whether this is an assistant turn that asked for tools
    pub fn requests_tools(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// Context handed to the provider for one round
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut conv = Self::new();
        conv.push(Message::system(prompt));
        conv
    }

    /// Build a context from stored history
    ///
    /// Keeps at most `max_history` of the newest messages (0 keeps all),
    /// widened so no tool-call chain is cut, then drops any chain that is
    /// still incomplete.
    pub fn from_history(system_prompt: Option<&str>, history: &[Message], max_history: usize) -> Self {
        let mut conv = system_prompt
            .filter(|p| !p.trim().is_empty())
            .map_or_else(Self::new, Self::with_system_prompt);
        conv.messages
            .extend(repair_tool_chains(window_history(history, max_history)));
        conv
    }

    /// Add a message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Get the last message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Newest `max` messages, extended backwards past any partial tool chain
pub fn window_history(history: &[Message], max: usize) -> &[Message] {
    if max == 0 || history.len() <= max {
        return history;
    }

    let mut start = history.len() - max;
    while start > 0 && (history[start].role == Role::Tool || history[start].requests_tools()) {
        start -= 1;
    }
    &history[start..]
}

/// Drop tool results without a matching request and requests without all results
///
/// Providers reject transcripts where call ids do not line up, so this runs on
/// the context only; the stored transcript is never rewritten.
pub fn repair_tool_chains(messages: &[Message]) -> Vec<Message> {
    let mut repaired = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let msg = &messages[i];

        if msg.requests_tools() {
            let mut end = i + 1;
            while end < messages.len() && messages[end].role == Role::Tool {
                end += 1;
            }

            let requested: HashSet<&str> = msg.tool_calls.iter().map(|c| c.id.as_str()).collect();
            let answered: Vec<&Message> = messages[i + 1..end]
                .iter()
                .filter(|m| m.tool_call_id.as_deref().is_some_and(|id| requested.contains(id)))
                .collect();
            let answered_ids: HashSet<&str> = answered
                .iter()
                .filter_map(|m| m.tool_call_id.as_deref())
                .collect();

            if answered_ids.len() == requested.len() {
                repaired.push(msg.clone());
                repaired.extend(answered.into_iter().cloned());
            } else {
                tracing::warn!(
                    requested = requested.len(),
                    answered = answered_ids.len(),
                    "Dropping incomplete tool-call chain from context"
                );
            }
            i = end;
            continue;
        }

        if msg.role == Role::Tool {
            tracing::warn!(tool_call_id = ?msg.tool_call_id, "Dropping orphaned tool result from context");
        } else {
            repaired.push(msg.clone());
        }
        i += 1;
    }

    repaired
}
