//! Session persistence, caching and per-key turn locks.
//!
//! File format: JSONL in `~/.tidebot/sessions/{key_filename}.jsonl`
//! - Line 1: `{"_type":"metadata","key":"...","created_at":"...","updated_at":"...","turns":3,...}`
//! - Line 2+: one `Message` per line
//!
//! Files are rewritten through a temp file and a rename, so a reader never
//! sees half a turn.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Message, Session};
use crate::utils;

/// Guard for the single-writer lock of one session key.
pub type SessionLock = tokio::sync::OwnedMutexGuard<()>;

/// Sessions kept in memory before the least recently updated is dropped.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session '{key}' is corrupt at line {line}: {message}")]
    Corrupt {
        key: String,
        line: usize,
        message: String,
    },
}

// ─────────────────────────────────────────────
// Session metadata (first line of JSONL)
// ─────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct SessionMetadata {
    #[serde(rename = "_type")]
    record_type: String,
    #[serde(default)]
    key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    model_override: Option<String>,
    #[serde(default)]
    turns: u64,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

// ─────────────────────────────────────────────
// SessionManager
// ─────────────────────────────────────────────

/// Owns every [`Session`]: cached in memory, persisted as JSONL.
///
/// Writers must hold [`lock`](Self::lock) for the key they mutate.
/// The cache is bounded; disk stays the source of truth.
pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: RwLock<HashMap<String, Session>>,
    cache_capacity: usize,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Base key → active key, changed by session switching.
    active: RwLock<HashMap<String, String>>,
}

impl SessionManager {
    /// Create a new session manager.
    ///
    /// `sessions_dir` defaults to `~/.tidebot/sessions/` if `None`.
    /// The directory is created if it doesn't exist.
    pub fn new(sessions_dir: Option<PathBuf>) -> std::io::Result<Self> {
        let dir = sessions_dir.unwrap_or_else(utils::get_sessions_path);
        std::fs::create_dir_all(&dir)?;

        Ok(SessionManager {
            sessions_dir: dir,
            cache: RwLock::new(HashMap::new()),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            locks: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        })
    }

    /// Keep at most `capacity` sessions in memory (minimum 1).
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Wait for exclusive turn access to `key`. Waiters are served in FIFO order.
    ///
    /// Locks nobody holds or waits on are dropped from the table here.
    pub async fn lock(&self, key: &str) -> SessionLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Load a session, creating an empty one if it does not exist yet.
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub fn load(&self, key: &str) -> Result<Session, SessionError> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(session) = cache.get(key) {
                return Ok(session.clone());
            }
        }

        let session = self
            .load_from_disk(key)?
            .unwrap_or_else(|| Session::new(key));
        self.cache_insert(session.clone());
        Ok(session)
    }

    /// Like [`load`](Self::load), but replaces an unreadable session with an empty one.
    pub fn get_or_create(&self, key: &str) -> Session {
        match self.load(key) {
            Ok(session) => session,
            Err(e) => {
                warn!(session = key, error = %e, "Session unreadable, starting fresh");
                Session::new(key)
            }
        }
    }

    /// Append one finished turn and bump the turn counter. Returns the new count.
    pub fn commit_turn(&self, key: &str, messages: Vec<Message>) -> Result<u64, SessionError> {
        let mut session = self.get_or_create(key);
        session.messages.extend(messages);
        session.turns += 1;
        session.updated_at = Utc::now();
        self.store(session).map(|s| s.turns)
    }

    /// Number the next turn of `key` will carry.
    pub fn next_turn(&self, key: &str) -> Result<u64, SessionError> {
        Ok(self.load(key)?.turns + 1)
    }

    /// Get the messages of the last `max_turns` turns.
    pub fn get_history(&self, key: &str, max_turns: usize) -> Vec<Message> {
        self.get_or_create(key).recent_history(max_turns).to_vec()
    }

    /// Clear all messages in a session. The turn counter keeps counting.
    pub fn clear(&self, key: &str) -> Result<(), SessionError> {
        let mut session = self.get_or_create(key);
        session.messages.clear();
        session.updated_at = Utc::now();
        self.store(session).map(|_| ())
    }

    /// Set or reset the model used for this session.
    pub fn set_model_override(&self, key: &str, model: Option<String>) -> Result<(), SessionError> {
        let mut session = self.get_or_create(key);
        session.model_override = model;
        session.updated_at = Utc::now();
        self.store(session).map(|_| ())
    }

    /// The session key currently selected for `base_key`.
    pub fn active_key(&self, base_key: &str) -> String {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(base_key)
            .cloned()
            .unwrap_or_else(|| base_key.to_string())
    }

    /// Point `base_key` at a named sibling session (`"{base}#{name}"`), or
    /// back at itself when `name` is `None`. Returns the new active key.
    pub fn switch(&self, base_key: &str, name: Option<&str>) -> String {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        match name {
            Some(name) => {
                let key = format!("{base_key}#{name}");
                active.insert(base_key.to_string(), key.clone());
                key
            }
            None => {
                active.remove(base_key);
                base_key.to_string()
            }
        }
    }

    /// Delete a session entirely (from cache and disk).
    ///
    /// Returns `true` if the session file existed on disk.
    pub fn delete(&self, key: &str) -> bool {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);

        let path = self.session_path(key);
        if !path.exists() {
            return false;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted session file: {}", path.display());
                true
            }
            Err(e) => {
                warn!("Failed to delete session file: {}", e);
                false
            }
        }
    }

    /// List all sessions from disk, newest first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();

        let entries = match std::fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read sessions directory: {}", e);
                return summaries;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "jsonl") {
                continue;
            }
            let Ok(file) = std::fs::File::open(&path) else {
                continue;
            };
            let Some(Ok(line)) = std::io::BufReader::new(file).lines().next() else {
                continue;
            };
            if let Ok(meta) = serde_json::from_str::<SessionMetadata>(&line) {
                let key = meta.key.unwrap_or_else(|| {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_string()
                });
                summaries.push(SessionSummary {
                    key,
                    created_at: meta.created_at,
                    updated_at: meta.updated_at,
                    turns: meta.turns,
                    path: path.clone(),
                });
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    fn store(&self, session: Session) -> Result<Session, SessionError> {
        self.save_to_disk(&session)?;
        self.cache_insert(session.clone());
        Ok(session)
    }

    fn cache_insert(&self, session: Session) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let key = session.key.clone();
        cache.insert(key.clone(), session);
        while cache.len() > self.cache_capacity {
            let oldest = cache
                .values()
                .filter(|s| s.key != key)
                .min_by_key(|s| s.updated_at)
                .map(|s| s.key.clone());
            match oldest {
                Some(old) => {
                    cache.remove(&old);
                }
                None => break,
            }
        }
    }

    /// File backing `key`. Distinct keys never share a file.
    pub fn session_path(&self, key: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.jsonl", utils::key_filename(key)))
    }

    fn load_from_disk(&self, key: &str) -> Result<Option<Session>, SessionError> {
        let path = self.session_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let reader = std::io::BufReader::new(std::fs::File::open(&path)?);
        let mut session = Session::new(key);
        let corrupt = |line: usize, message: String| SessionError::Corrupt {
            key: key.to_string(),
            line,
            message,
        };

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value =
                serde_json::from_str(&line).map_err(|e| corrupt(idx + 1, e.to_string()))?;

            if value.get("_type").and_then(|t| t.as_str()) == Some("metadata") {
                let meta: SessionMetadata =
                    serde_json::from_value(value).map_err(|e| corrupt(idx + 1, e.to_string()))?;
                if let Some(owner) = meta.key.as_deref().filter(|owner| *owner != key) {
                    return Err(corrupt(idx + 1, format!("file belongs to session '{owner}'")));
                }
                session.created_at = meta.created_at;
                session.updated_at = meta.updated_at;
                session.model_override = meta.model_override;
                session.turns = meta.turns;
                session.metadata = meta.metadata;
                continue;
            }

            let msg: Message =
                serde_json::from_value(value).map_err(|e| corrupt(idx + 1, e.to_string()))?;
            session.messages.push(msg);
        }

        debug!(
            "Loaded session '{}' with {} messages from disk",
            key,
            session.messages.len()
        );
        Ok(Some(session))
    }

    fn save_to_disk(&self, session: &Session) -> std::io::Result<()> {
        let path = self.session_path(&session.key);
        let tmp = path.with_extension("jsonl.tmp");

        {
            let mut file = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
            let meta = SessionMetadata {
                record_type: "metadata".to_string(),
                key: Some(session.key.clone()),
                created_at: session.created_at,
                updated_at: session.updated_at,
                model_override: session.model_override.clone(),
                turns: session.turns,
                metadata: session.metadata.clone(),
            };
            writeln!(file, "{}", serde_json::to_string(&meta)?)?;
            for msg in &session.messages {
                writeln!(file, "{}", serde_json::to_string(msg)?)?;
            }
            file.flush()?;
        }
        std::fs::rename(&tmp, &path)?;

        debug!(
            "Saved session '{}' ({} messages) to {}",
            session.key,
            session.messages.len(),
            path.display()
        );
        Ok(())
    }
}

/// Summary of a session for listing purposes.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: u64,
    pub path: PathBuf,
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
