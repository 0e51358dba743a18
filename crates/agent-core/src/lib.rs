//! # agent-core
//!
//! Tool-calling orchestration and session engine, independent of any LLM
//! vendor or transport.
//!
//! ## Architecture
//!
//! ```text
//!  client request                          external agent (JSON-RPC)
//!        │                                           │
//! ┌──────▼───────────────────────────┐     ┌─────────▼────────┐
//! │          Orchestrator            │     │  ProtocolBridge  │
//! │  ┌─────────────┐ ┌────────────┐  │     └─────────┬────────┘
//! │  │ LlmProvider │ │SessionStore│  │               │
//! │  │ (Strategy)  │ │ + locks    │  │               │
//! │  └─────────────┘ └────────────┘  │               │
//! └──────────────┬───────────────────┘               │
//!                └──────────► ToolRegistry ◄─────────┘
//! ```
//!
//! The `LlmProvider` trait enables swapping between OpenAI-compatible
//! endpoints, Qwen, Ollama or any other backend without changing the loop.

pub mod bridge;
pub mod error;
pub mod jsonrpc;
pub mod message;
pub mod orchestrator;
pub mod provider;
pub mod session;
pub mod tool;

pub use bridge::{CallToolResult, ProtocolBridge, ToolDescriptor};
pub use error::{AgentError, Result};
pub use message::{Conversation, Message, Role};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorConfig, ToolCallSummary, TurnFailure, TurnOutcome, TurnRequest,
};
pub use provider::{Completion, GenerationOptions, LlmProvider, ProviderReply, TokenUsage};
pub use session::{MemorySessionStore, Session, SessionId, SessionLocks, SessionStore};
pub use tokio_util::sync::CancellationToken;
pub use tool::{InvocationStatus, ParameterSchema, Tool, ToolCall, ToolInvocation, ToolRegistry, ToolSchema};
