use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{short_id, ConversationEntry, Session, SessionStatus, SessionStore, SessionView};
use crate::config::Config;
use crate::error::{ControlError, Result};
use crate::runtime::{ContainerRuntime, SandboxSpec, SandboxStatus};

/// Provisions sandboxes and keeps session records in line with the runtime.
pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: SessionStore,
    base_directory: PathBuf,
    image: String,
}

impl SessionManager {
    /// Creates a manager over an already opened store.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: SessionStore,
        base_directory: PathBuf,
        image: String,
    ) -> Self {
        Self {
            runtime,
            store,
            base_directory,
            image,
        }
    }

    /// Opens the session store named by `config` and builds a manager.
    pub async fn open(runtime: Arc<dyn ContainerRuntime>, config: &Config) -> Result<Self> {
        let store = SessionStore::open(config.storage.sessions_path()).await?;
        Ok(Self::new(
            runtime,
            store,
            config.storage.base_directory.clone(),
            config.sandbox.image.clone(),
        ))
    }

    /// The runtime sandboxes are provisioned on.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// The backing session store.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Provisions a workspace and sandbox for a new session.
    ///
    /// Not atomic: if provisioning fails the workspace directory is left in
    /// place for diagnosis.
    pub async fn create_session(&self, task: &str) -> Result<Session> {
        let mut session_id = short_id();
        while self.store.get(&session_id).await.is_some() {
            session_id = short_id();
        }

        let workdir = self.base_directory.join(format!("session_{session_id}"));
        tokio::fs::create_dir_all(&workdir).await.map_err(|e| {
            ControlError::provision(format!(
                "Failed to create workspace {}: {e}",
                workdir.display()
            ))
        })?;

        self.runtime.ping().await?;
        self.runtime.ensure_image(&self.image).await?;
        let container_id = self
            .runtime
            .create_sandbox(&SandboxSpec {
                session_id: session_id.clone(),
                workspace: workdir.clone(),
            })
            .await?;

        let session = Session {
            session_id: session_id.clone(),
            container_id: container_id.clone(),
            workdir,
            created: Utc::now(),
            last_task: task.to_string(),
            last_activity: None,
            conversation_history: Vec::new(),
            status: SessionStatus::Active,
        };
        self.store.insert(session.clone()).await?;

        info!(
            session_id = %session_id,
            container_id = %container_id,
            "Session created"
        );
        Ok(session)
    }

    /// Cached lookup without probing the runtime.
    pub async fn lookup(&self, id: &str) -> Result<Session> {
        if let Some(session) = self.store.get(id).await {
            return Ok(session);
        }
        // Another process may have created it since the cache was filled
        self.store
            .reload()
            .await?
            .into_iter()
            .find(|session| session.session_id == id)
            .ok_or_else(|| ControlError::not_found("session", id))
    }

    /// Looks up a session and probes its sandbox.
    ///
    /// A session whose sandbox no longer exists is evicted and reported as
    /// not found.
    pub async fn get_session(&self, id: &str) -> Result<SessionView> {
        let session = self.lookup(id).await?;
        match self.runtime.sandbox_status(&session.container_id).await? {
            Some(sandbox_status) => Ok(SessionView {
                session,
                sandbox_status,
            }),
            None => {
                info!(session_id = %id, "Sandbox vanished, evicting session");
                self.store.remove(id).await?;
                Err(ControlError::not_found("session", id))
            }
        }
    }

    /// Reloads every session from disk and reconciles it with the runtime.
    ///
    /// Sessions whose sandbox vanished are removed; the rest are marked
    /// `active` or `stale` depending on whether the sandbox is running.
    pub async fn list_sessions(&self) -> Result<Vec<SessionView>> {
        let sessions = self.store.reload().await?;

        let mut vanished = Vec::new();
        let mut survivors = Vec::new();
        for session in sessions {
            match self.runtime.sandbox_status(&session.container_id).await {
                Ok(Some(sandbox_status)) => survivors.push((session, sandbox_status)),
                Ok(None) => vanished.push(session.session_id),
                Err(e) => {
                    warn!(session_id = %session.session_id, "Failed to probe sandbox: {}", e);
                    survivors.push((session, SandboxStatus::Unknown));
                }
            }
        }

        let mut changed = !vanished.is_empty();
        for (session, sandbox_status) in &mut survivors {
            let status = match *sandbox_status {
                SandboxStatus::Running => SessionStatus::Active,
                SandboxStatus::Unknown => session.status,
                _ => SessionStatus::Stale,
            };
            if status != session.status {
                session.status = status;
                changed = true;
            }
        }

        if changed {
            let statuses: Vec<(String, SessionStatus)> = survivors
                .iter()
                .map(|(session, _)| (session.session_id.clone(), session.status))
                .collect();
            self.store
                .mutate(|stored| {
                    for id in &vanished {
                        stored.remove(id);
                    }
                    for (id, status) in &statuses {
                        if let Some(session) = stored.get_mut(id) {
                            session.status = *status;
                        }
                    }
                })
                .await?;
            for id in &vanished {
                info!(session_id = %id, "Sandbox vanished, pruned session");
            }
        }

        Ok(survivors
            .into_iter()
            .map(|(session, sandbox_status)| SessionView {
                session,
                sandbox_status,
            })
            .collect())
    }

    /// Replaces the conversation payload. Last write wins.
    ///
    /// `last_task` is only replaced when a non-empty value is given.
    pub async fn update_conversation(
        &self,
        id: &str,
        conversation: Vec<ConversationEntry>,
        last_task: Option<&str>,
    ) -> Result<Session> {
        let last_task = last_task.filter(|task| !task.is_empty());
        self.store
            .update(id, |session| {
                session.conversation_history = conversation;
                session.last_activity = Some(Utc::now());
                if let Some(task) = last_task {
                    session.last_task = task.to_string();
                }
            })
            .await?
            .ok_or_else(|| ControlError::not_found("session", id))
    }

    /// Stops the sandbox (best-effort) and removes the session record.
    pub async fn cleanup_session(&self, id: &str) -> Result<Session> {
        let session = self.lookup(id).await?;

        if let Err(e) = self.runtime.stop_sandbox(&session.container_id).await {
            warn!(session_id = %id, "Failed to stop sandbox: {}", e);
        }
        self.store.remove(id).await?;

        info!(session_id = %id, "Session cleaned up");
        Ok(session)
    }

    /// Cleans up every known session, returning how many were removed.
    pub async fn cleanup_all(&self) -> Result<usize> {
        let sessions = self.store.reload().await?;
        let mut removed = 0;
        for session in sessions {
            match self.cleanup_session(&session.session_id).await {
                Ok(_) => removed += 1,
                Err(e) if e.is_not_found() => {
                    debug!(session_id = %session.session_id, "Already removed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HostRuntime;
    use pretty_assertions::assert_eq;
    use tempfile::{tempdir, TempDir};

    async fn manager(dir: &TempDir) -> (SessionManager, Arc<HostRuntime>) {
        let runtime = Arc::new(HostRuntime::default());
        let store = SessionStore::open(dir.path().join("active_sessions.json"))
            .await
            .unwrap();
        let manager = SessionManager::new(
            runtime.clone(),
            store,
            dir.path().to_path_buf(),
            "test-image".to_string(),
        );
        (manager, runtime)
    }

    #[tokio::test]
    async fn test_created_session_is_running() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir).await;

        let session = manager.create_session("build a web server").await.unwrap();
        assert!(session.workdir.is_dir());
        assert!(session
            .workdir
            .ends_with(format!("session_{}", session.session_id)));

        let view = manager.get_session(&session.session_id).await.unwrap();
        assert_eq!(view.sandbox_status, SandboxStatus::Running);
        assert_eq!(view.session.last_task, "build a web server");
    }

    #[tokio::test]
    async fn test_get_session_evicts_vanished_sandbox() {
        let dir = tempdir().unwrap();
        let (manager, runtime) = manager(&dir).await;
        let session = manager.create_session("task").await.unwrap();

        runtime.remove_sandbox(&session.container_id);

        let err = manager.get_session(&session.session_id).await.unwrap_err();
        assert!(err.is_not_found());
        // Eviction was written through
        let reopened = SessionStore::open(manager.store().path()).await.unwrap();
        assert!(reopened.get(&session.session_id).await.is_none());
        assert!(manager.get_session(&session.session_id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_sessions_prunes_and_marks_stale() {
        let dir = tempdir().unwrap();
        let (manager, runtime) = manager(&dir).await;
        let gone = manager.create_session("one").await.unwrap();
        let stopped = manager.create_session("two").await.unwrap();
        let running = manager.create_session("three").await.unwrap();

        runtime.remove_sandbox(&gone.container_id);
        runtime.stop_sandbox(&stopped.container_id).await.unwrap();

        let mut views = manager.list_sessions().await.unwrap();
        views.sort_by(|a, b| a.session.last_task.cmp(&b.session.last_task));
        let summary: Vec<_> = views
            .iter()
            .map(|v| (v.session.session_id.clone(), v.session.status, v.sandbox_status))
            .collect();
        assert_eq!(
            summary,
            vec![
                (
                    running.session_id.clone(),
                    SessionStatus::Active,
                    SandboxStatus::Running
                ),
                (
                    stopped.session_id.clone(),
                    SessionStatus::Stale,
                    SandboxStatus::Exited
                ),
            ]
        );

        let reopened = SessionStore::open(manager.store().path()).await.unwrap();
        assert!(reopened.get(&gone.session_id).await.is_none());
        assert_eq!(
            reopened.get(&stopped.session_id).await.unwrap().status,
            SessionStatus::Stale
        );
    }

    #[tokio::test]
    async fn test_update_conversation() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir).await;
        let session = manager.create_session("first").await.unwrap();

        let history = vec![
            ConversationEntry::text("user", "hello"),
            ConversationEntry::text("assistant", "hi"),
        ];
        let updated = manager
            .update_conversation(&session.session_id, history.clone(), Some("second"))
            .await
            .unwrap();
        assert_eq!(updated.conversation_history, history);
        assert_eq!(updated.last_task, "second");
        assert!(updated.last_activity.is_some());

        // Empty task keeps the previous one; payload is replaced wholesale
        let updated = manager
            .update_conversation(&session.session_id, Vec::new(), Some(""))
            .await
            .unwrap();
        assert_eq!(updated.last_task, "second");
        assert!(updated.conversation_history.is_empty());

        let err = manager
            .update_conversation("00000000", Vec::new(), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cleanup_session() {
        let dir = tempdir().unwrap();
        let (manager, runtime) = manager(&dir).await;
        let session = manager.create_session("task").await.unwrap();

        manager.cleanup_session(&session.session_id).await.unwrap();
        assert_eq!(
            runtime.sandbox_status(&session.container_id).await.unwrap(),
            Some(SandboxStatus::Exited)
        );
        assert!(manager.store().get(&session.session_id).await.is_none());

        let err = manager.cleanup_session(&session.session_id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_missing_sandbox() {
        let dir = tempdir().unwrap();
        let (manager, runtime) = manager(&dir).await;
        let session = manager.create_session("task").await.unwrap();
        runtime.remove_sandbox(&session.container_id);

        assert!(manager.cleanup_session(&session.session_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir).await;
        manager.create_session("one").await.unwrap();
        manager.create_session("two").await.unwrap();

        assert_eq!(manager.cleanup_all().await.unwrap(), 2);
        assert!(manager.list_sessions().await.unwrap().is_empty());
    }
}
