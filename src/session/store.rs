use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::Session;
use crate::error::{ControlError, Result};

type SessionMap = BTreeMap<String, Session>;

/// File-backed session table.
///
/// The in-memory map is a cache of the file. Every mutation reloads the file,
/// applies the change and rewrites the whole file while holding one lock, so
/// the two never diverge once a call returns.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    sessions: Mutex<SessionMap>,
}

impl SessionStore {
    /// Opens the store at `path`, loading any existing records.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (sessions, _) = read_sessions(&path).await?;
        debug!("Loaded {} sessions from {}", sessions.len(), path.display());
        Ok(Self {
            path,
            sessions: Mutex::new(sessions),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached record for `id`, without touching disk.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Number of cached records.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Returns true if no records are cached.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Replaces the cache with the file contents and returns every record.
    pub async fn reload(&self) -> Result<Vec<Session>> {
        let mut sessions = self.sessions.lock().await;
        *sessions = read_sessions(&self.path).await?.0;
        Ok(sessions.values().cloned().collect())
    }

    /// Inserts or replaces a record.
    pub async fn insert(&self, session: Session) -> Result<()> {
        self.mutate(|sessions| {
            sessions.insert(session.session_id.clone(), session);
        })
        .await
    }

    /// Removes a record, returning it if it existed.
    pub async fn remove(&self, id: &str) -> Result<Option<Session>> {
        self.mutate(|sessions| sessions.remove(id)).await
    }

    /// Applies `f` to one record, returning the updated copy.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<Option<Session>>
    where
        F: FnOnce(&mut Session),
    {
        self.mutate(|sessions| {
            sessions.get_mut(id).map(|session| {
                f(session);
                session.clone()
            })
        })
        .await
    }

    /// Load, modify and rewrite the whole store under the lock.
    ///
    /// Records that fail to parse are written back untouched unless `f`
    /// inserts a session under the same id.
    pub async fn mutate<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut SessionMap) -> R,
    {
        let mut sessions = self.sessions.lock().await;
        let (mut fresh, unreadable) = read_sessions(&self.path).await?;
        let result = f(&mut fresh);
        write_sessions(&self.path, &fresh, unreadable).await?;
        *sessions = fresh;
        Ok(result)
    }
}

/// Raw JSON of records that did not parse, keyed by id.
type RawMap = BTreeMap<String, Value>;

async fn read_sessions(path: &Path) -> Result<(SessionMap, RawMap)> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((SessionMap::new(), RawMap::new()))
        }
        Err(e) => return Err(ControlError::store(path, e)),
    };
    if content.trim().is_empty() {
        return Ok((SessionMap::new(), RawMap::new()));
    }

    let raw: RawMap = serde_json::from_str(&content).map_err(|e| ControlError::store(path, e))?;

    // One malformed record must not hide the others
    let mut sessions = SessionMap::new();
    let mut unreadable = RawMap::new();
    for (id, value) in raw {
        match serde_json::from_value::<Session>(value.clone()) {
            Ok(session) => {
                sessions.insert(id, session);
            }
            Err(e) => {
                warn!(session_id = %id, "Skipping unreadable session record: {}", e);
                unreadable.insert(id, value);
            }
        }
    }
    Ok((sessions, unreadable))
}

async fn write_sessions(path: &Path, sessions: &SessionMap, mut records: RawMap) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ControlError::store(path, e))?;
    }

    for (id, session) in sessions {
        let value = serde_json::to_value(session).map_err(|e| ControlError::store(path, e))?;
        records.insert(id.clone(), value);
    }

    let content = serde_json::to_string_pretty(&records).map_err(|e| ControlError::store(path, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| ControlError::store(path, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ControlError::store(path, e))?;
    Ok(())
}
