use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot prepare session dir {path:?}: {source}")]
    Dir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("session file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("session file {path:?} is corrupt: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("cannot encode session: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub history: String,
    pub tokens: usize,
    #[serde(skip)]
    pub ephemeral: bool,
}

/// Session id → conversation history. Lives inside the scheduler lock.
#[derive(Debug, Default)]
pub struct SessionStore {
    swap_dir: Option<PathBuf>,
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_swap_dir(dir: &Path) -> Result<Self, SessionError> {
        fs::create_dir_all(dir).map_err(|source| SessionError::Dir {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            swap_dir: Some(dir.to_path_buf()),
            sessions: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// In-memory entry, loading the persisted file on first reference.
    pub fn entry(&mut self, id: &str) -> &mut Session {
        if !self.sessions.contains_key(id) {
            let loaded = match self.load(id) {
                Ok(Some(session)) => {
                    tracing::debug!(session = id, tokens = session.tokens, "session loaded from disk");
                    session
                }
                Ok(None) => Session::default(),
                Err(err) => {
                    tracing::warn!(session = id, error = %err, "ignoring unreadable session file");
                    Session::default()
                }
            };
            self.sessions.insert(id.to_string(), loaded);
        }
        self.sessions.entry(id.to_string()).or_default()
    }

    /// Resets the session when `tokens + predict/2 + 4` would not fit in `context`.
    /// Returns true when a reset happened.
    pub fn enforce_budget(&mut self, id: &str, predict: usize, context: usize) -> bool {
        let session = self.entry(id);
        if session.tokens + predict / 2 + 4 <= context {
            return false;
        }
        let dropped = session.tokens;
        session.history.clear();
        session.tokens = 0;
        let ephemeral = session.ephemeral;
        if !ephemeral {
            self.delete_file(id);
        }
        tracing::info!(session = id, dropped_tokens = dropped, context, "session over budget, reset");
        true
    }

    pub fn history(&mut self, id: &str) -> String {
        self.entry(id).history.clone()
    }

    /// Stores the engine's raw text as the new history and persists it.
    pub fn record(&mut self, id: &str, history: String, output_tokens: usize) {
        let session = self.entry(id);
        session.history = history;
        session.tokens += output_tokens;
        if session.ephemeral {
            return;
        }
        let snapshot = session.clone();
        if let Err(err) = self.persist(id, &snapshot) {
            tracing::warn!(session = id, error = %err, "session persist failed");
        }
    }

    /// In-memory only session holding a ready-made chat history.
    pub fn seed_ephemeral(&mut self, id: &str, history: String) {
        self.sessions.insert(
            id.to_string(),
            Session {
                history,
                tokens: 0,
                ephemeral: true,
            },
        );
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    fn session_path(&self, id: &str) -> Option<PathBuf> {
        let dir = self.swap_dir.as_ref()?;
        is_safe_id(id).then(|| dir.join(format!("{}.json", id)))
    }

    fn load(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let Some(path) = self.session_path(id) else {
            return Ok(None);
        };
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SessionError::Io { path, source }),
        };
        let session = serde_json::from_slice(&raw)
            .map_err(|source| SessionError::Decode { path, source })?;
        Ok(Some(session))
    }

    fn persist(&self, id: &str, session: &Session) -> Result<(), SessionError> {
        let (Some(dir), Some(path)) = (self.swap_dir.as_ref(), self.session_path(id)) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(session)?;
        write_atomic(dir, &path, &payload)
    }

    fn delete_file(&self, id: &str) {
        let Some(path) = self.session_path(id) else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(session = id, "session file removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(session = id, error = %err, "cannot remove session file"),
        }
    }
}

/// Only `[A-Za-z0-9_-]` ids up to 128 chars map onto a file name.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn write_atomic(dir: &Path, final_path: &Path, payload: &[u8]) -> Result<(), SessionError> {
    let tmp_path = final_path.with_extension("json.tmp");
    if tmp_path.parent() != Some(dir) || final_path.parent() != Some(dir) {
        return Err(SessionError::Io {
            path: final_path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "session path escaped swap dir",
            ),
        });
    }
    let io_err = |source: std::io::Error| SessionError::Io {
        path: tmp_path.clone(),
        source,
    };

    let mut tmp_file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(io_err)?;

    let written = tmp_file
        .write_all(payload)
        .and_then(|_| tmp_file.sync_all());
    drop(tmp_file);
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(err));
    }

    if let Err(source) = fs::rename(&tmp_path, final_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(SessionError::Io {
            path: final_path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
