//! Session Management
//!
//! Append-only conversation history keyed by session id, and the per-session
//! lock that keeps concurrent turns on the same session strictly ordered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::error::Result;
use crate::message::Message;

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

/// A conversation session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,

    /// Instructions sent ahead of the history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Conversation history, in causal order
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create an empty session
    pub fn new(id: SessionId, system_prompt: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            system_prompt,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Message count
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// Session store trait for persistence
///
/// Unknown ids are never an error: `get`, `append_all` and `clear` create the
/// session on first reference.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session, creating an empty one if the id is new
    async fn get(&self, id: &SessionId) -> Result<Session>;

    /// Atomically append messages in order
    async fn append_all(&self, id: &SessionId, messages: Vec<Message>) -> Result<()>;

    /// Append a single message
    async fn append(&self, id: &SessionId, message: Message) -> Result<()> {
        self.append_all(id, vec![message]).await
    }

    /// Replace the message sequence with an empty one, keeping the session
    async fn clear(&self, id: &SessionId) -> Result<()>;

    /// Replace the stored system prompt
    async fn set_system_prompt(&self, id: &SessionId, prompt: Option<String>) -> Result<()>;

    /// All known session ids, oldest first
    async fn list_ids(&self) -> Result<Vec<SessionId>>;
}

#[derive(Default)]
struct MemoryIndex {
    sessions: HashMap<SessionId, Arc<Mutex<Session>>>,
    order: Vec<SessionId>,
}

/// In-memory session store
///
/// The outer lock guards only the id index; each session has its own mutex so
/// writes to different sessions never contend.
pub struct MemorySessionStore {
    index: RwLock<MemoryIndex>,
    default_system_prompt: Option<String>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(MemoryIndex::default()),
            default_system_prompt: None,
        }
    }

    /// System prompt given to sessions created implicitly
    pub fn with_default_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.default_system_prompt = Some(prompt.into());
        self
    }

    fn slot(&self, id: &SessionId) -> Arc<Mutex<Session>> {
        if let Some(slot) = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .get(id)
        {
            return slot.clone();
        }

        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = index.sessions.get(id) {
            return slot.clone();
        }

        tracing::info!(session_id = %id, "Creating session");
        let slot = Arc::new(Mutex::new(Session::new(
            id.clone(),
            self.default_system_prompt.clone(),
        )));
        index.sessions.insert(id.clone(), slot.clone());
        index.order.push(id.clone());
        slot
    }

    fn with_session<T>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> T) -> T {
        let slot = self.slot(id);
        let mut session = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut session)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &SessionId) -> Result<Session> {
        Ok(self.with_session(id, |s| s.clone()))
    }

    async fn append_all(&self, id: &SessionId, messages: Vec<Message>) -> Result<()> {
        self.with_session(id, |s| {
            s.messages.extend(messages);
            s.touch();
        });
        Ok(())
    }

    async fn clear(&self, id: &SessionId) -> Result<()> {
        self.with_session(id, |s| {
            s.messages.clear();
            s.touch();
        });
        Ok(())
    }

    async fn set_system_prompt(&self, id: &SessionId, prompt: Option<String>) -> Result<()> {
        self.with_session(id, |s| {
            s.system_prompt = prompt;
            s.touch();
        });
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<SessionId>> {
        Ok(self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone())
    }
}

/// Per-session execution lock
///
/// Waiters are served in arrival order. Entries nobody holds or waits on are
/// pruned on the next acquisition.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of a session
    pub async fn acquire(&self, id: &SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of sessions currently held or awaited
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}
