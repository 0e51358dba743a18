//! File-backed Session Store
//!
//! One `<id>.jsonl` file per session. The first line is the session header,
//! every following line one appended message, so an append is a single
//! `O_APPEND` write. Clearing and prompt changes rewrite the file through a
//! temporary and a rename.

use std::fmt::Write as _;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use agent_core::{
    error::{AgentError, Result},
    message::Message,
    session::{Session, SessionId, SessionLocks, SessionStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionHeader {
    id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system_prompt: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RecordRef<'a> {
    Session(&'a SessionHeader),
    Message(&'a Message),
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Session(SessionHeader),
    Message(Box<Message>),
}

/// Append-only JSONL session store
pub struct JsonlSessionStore {
    dir: PathBuf,
    default_system_prompt: Option<String>,
    locks: SessionLocks,
}

impl JsonlSessionStore {
    /// Open (and create if needed) a store directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| persistence(&dir, &e))?;
        tracing::info!(dir = %dir.display(), "Opened session directory");
        Ok(Self {
            dir,
            default_system_prompt: None,
            locks: SessionLocks::new(),
        })
    }

    /// System prompt given to sessions created implicitly
    pub fn with_default_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.default_system_prompt = Some(prompt.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", file_stem(id)))
    }

    async fn load_or_create(&self, id: &SessionId) -> Result<Session> {
        let path = self.path_for(id);
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(parse_session(id, &text)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let session = Session::new(id.clone(), self.default_system_prompt.clone());
                self.write_session(&session).await?;
                tracing::info!(session_id = %id, "Creating session");
                Ok(session)
            }
            Err(e) => Err(persistence(&path, &e)),
        }
    }

    /// Replace the whole file with `session`
    async fn write_session(&self, session: &Session) -> Result<()> {
        let header = SessionHeader {
            id: session.id.clone(),
            system_prompt: session.system_prompt.clone(),
            created_at: session.created_at,
        };
        let mut buf = encode(&RecordRef::Session(&header))?;
        for message in &session.messages {
            buf.push_str(&encode(&RecordRef::Message(message))?);
        }

        let path = self.path_for(&session.id);
        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, buf).await.map_err(|e| persistence(&tmp, &e))?;
        fs::rename(&tmp, &path).await.map_err(|e| persistence(&path, &e))
    }

    async fn read_header(path: &Path) -> Option<SessionHeader> {
        let file = fs::File::open(path).await.ok()?;
        let line = BufReader::new(file).lines().next_line().await.ok()??;
        match serde_json::from_str::<Record>(&line) {
            Ok(Record::Session(header)) => Some(header),
            _ => {
                tracing::warn!(path = %path.display(), "Session file without header");
                None
            }
        }
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn get(&self, id: &SessionId) -> Result<Session> {
        let _guard = self.locks.acquire(id).await;
        self.load_or_create(id).await
    }

    async fn append_all(&self, id: &SessionId, messages: Vec<Message>) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let path = self.path_for(id);
        if !fs::try_exists(&path).await.map_err(|e| persistence(&path, &e))? {
            self.load_or_create(id).await?;
        }
        if messages.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        // Terminate a torn final line so it cannot swallow the next record.
        if has_torn_tail(&path).await? {
            tracing::warn!(session_id = %id, "Session file ends in a partial line");
            buf.push('\n');
        }
        for message in &messages {
            buf.push_str(&encode(&RecordRef::Message(message))?);
        }

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| persistence(&path, &e))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| persistence(&path, &e))?;
        file.flush().await.map_err(|e| persistence(&path, &e))?;

        tracing::debug!(session_id = %id, appended = messages.len(), "Appended messages");
        Ok(())
    }

    async fn clear(&self, id: &SessionId) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let mut session = self.load_or_create(id).await?;
        session.messages.clear();
        self.write_session(&session).await
    }

    async fn set_system_prompt(&self, id: &SessionId, prompt: Option<String>) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let mut session = self.load_or_create(id).await?;
        session.system_prompt = prompt;
        self.write_session(&session).await
    }

    async fn list_ids(&self) -> Result<Vec<SessionId>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| persistence(&self.dir, &e))?;

        let mut headers = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| persistence(&self.dir, &e))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                continue;
            }
            if let Some(header) = Self::read_header(&path).await {
                headers.push(header);
            }
        }

        headers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(headers.into_iter().map(|h| h.id).collect())
    }
}

/// Filesystem-safe, collision-free stem for a session id
fn file_stem(id: &SessionId) -> String {
    let mut stem = String::with_capacity(id.as_str().len());
    for b in id.as_str().bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            stem.push(char::from(b));
        } else {
            let _ = write!(stem, "~{b:02x}");
        }
    }
    stem
}

async fn has_torn_tail(path: &Path) -> Result<bool> {
    let mut file = fs::File::open(path).await.map_err(|e| persistence(path, &e))?;
    let len = file.metadata().await.map_err(|e| persistence(path, &e))?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))
        .await
        .map_err(|e| persistence(path, &e))?;
    let last = file.read_u8().await.map_err(|e| persistence(path, &e))?;
    Ok(last != b'\n')
}

fn encode(record: &RecordRef<'_>) -> Result<String> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

/// Rebuild a session; unreadable lines (e.g. a torn final write) are skipped
fn parse_session(id: &SessionId, text: &str) -> Session {
    let mut session = Session::new(id.clone(), None);
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(line) {
            Ok(Record::Session(header)) => {
                session.system_prompt = header.system_prompt;
                session.created_at = header.created_at;
            }
            Ok(Record::Message(message)) => session.messages.push(*message),
            Err(e) => {
                tracing::warn!(session_id = %id, line = lineno + 1, error = %e, "Skipping unreadable session line");
            }
        }
    }
    session.updated_at = session
        .messages
        .last()
        .map_or(session.created_at, |m| m.timestamp);
    session
}

fn persistence(path: &Path, err: &std::io::Error) -> AgentError {
    AgentError::Persistence(format!("{}: {err}", path.display()))
}
