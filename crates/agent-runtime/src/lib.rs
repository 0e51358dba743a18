//! # agent-runtime
//!
//! Concrete backends for the agent-core contracts.
//!
//! ## Providers
//!
//! - **OpenAI-compatible** (default): any `/chat/completions` endpoint with
//!   function calling. Qwen via DashScope compatible mode, OpenAI, or a local
//!   Ollama server at `http://localhost:11434/v1`.
//!
//! ## Session stores
//!
//! - **JSONL**: one append-only file per session, for history that survives
//!   restarts. The in-memory store lives in agent-core.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{JsonlSessionStore, OpenAiCompatProvider};
//!
//! let provider = OpenAiCompatProvider::from_env()?;
//! let store = JsonlSessionStore::open("data/sessions").await?;
//! let orchestrator = Orchestrator::builder()
//!     .provider(Arc::new(provider))
//!     .store(Arc::new(store))
//!     .build()?;
//! ```

pub mod openai;
pub mod store;

pub use openai::{OpenAiCompatProvider, OpenAiConfig};
pub use store::JsonlSessionStore;

// Re-export core types for convenience
pub use agent_core::{AgentError, LlmProvider, Message, Orchestrator, Result, Role, Session, SessionStore, Tool, ToolRegistry};
