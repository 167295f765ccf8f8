//! Single entry point that wires the runtime, stores, hub and terminals.
//!
//! Transport adapters and the CLI talk to a [`ControlPlane`]; nothing above
//! it needs to know how sessions, shells and subscribers relate.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::exec::{ExecChannel, ExecMode, ExecOutput};
use crate::hub::{Attachment, Connection, ConnectionHub, ConnectionId, ServerMessage};
use crate::process::RegistryStore;
use crate::runtime::{self, ContainerRuntime};
use crate::session::{
    transcript, ConversationEntry, Session, SessionManager, SessionView, TranscriptMessage,
};
use crate::terminal::{ShellInfo, TerminalBridge};
use crate::tools::Toolbox;

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// `healthy` or `degraded`
    pub status: &'static str,
    /// Name of the configured runtime
    pub runtime: &'static str,
    pub runtime_available: bool,
    /// Sessions in the store, without reconciling them
    pub active_sessions: usize,
}

impl HealthReport {
    /// Returns true when the runtime answered the health check.
    pub fn is_healthy(&self) -> bool {
        self.runtime_available
    }
}

/// Entry point for every operation on sessions, shells and tools.
///
/// Owns the session manager, the connection hub and the terminal bridge,
/// all sharing one runtime.
pub struct ControlPlane {
    config: Config,
    sessions: SessionManager,
    hub: Arc<ConnectionHub>,
    terminals: Arc<TerminalBridge>,
    exec: ExecChannel,
    registries: Mutex<HashMap<String, Arc<RegistryStore>>>,
}

impl ControlPlane {
    /// Connects to the configured runtime and opens the session store.
    pub async fn open(config: Config) -> Result<Self> {
        let runtime = runtime::connect(&config.sandbox, &config.storage.base_directory)?;
        Self::with_runtime(config, runtime).await
    }

    /// Builds a control plane over an explicit runtime.
    pub async fn with_runtime(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let sessions = SessionManager::open(runtime.clone(), &config).await?;
        let hub = Arc::new(ConnectionHub::new());
        let terminals = Arc::new(TerminalBridge::new(
            runtime.clone(),
            hub.clone(),
            config.terminal.clone(),
        ));
        let exec = ExecChannel::new(runtime, config.sandbox.shell.clone());
        Ok(Self {
            config,
            sessions,
            hub,
            terminals,
            exec,
            registries: Mutex::new(HashMap::new()),
        })
    }

    /// Configuration the control plane was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connection hub used for broadcasts.
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Underlying session manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Provisions a workspace and sandbox for `task`.
    pub async fn create_session(&self, task: &str) -> Result<Session> {
        self.sessions.create_session(task).await
    }

    /// Looks up a session, evicting it if its sandbox is gone.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionView> {
        self.sessions.get_session(session_id).await
    }

    /// Every live session, reconciled against the runtime.
    pub async fn list_sessions(&self) -> Result<Vec<SessionView>> {
        self.sessions.list_sessions().await
    }

    /// Records `task` and the conversation payload on a session.
    pub async fn update_conversation(
        &self,
        session_id: &str,
        history: Vec<ConversationEntry>,
        last_task: Option<&str>,
    ) -> Result<Session> {
        self.sessions
            .update_conversation(session_id, history, last_task)
            .await
    }

    /// Tears down a session together with its shells and subscribers.
    pub async fn cleanup_session(&self, session_id: &str) -> Result<Session> {
        let session = self.sessions.cleanup_session(session_id).await?;
        self.release(session_id).await;
        Ok(session)
    }

    /// Tears down every session. Returns how many were removed.
    pub async fn cleanup_all(&self) -> Result<usize> {
        let ids: Vec<String> = self
            .sessions
            .store()
            .reload()
            .await?
            .into_iter()
            .map(|session| session.session_id)
            .collect();
        for id in &ids {
            self.release(id).await;
        }
        self.sessions.cleanup_all().await
    }

    async fn release(&self, session_id: &str) {
        let shells = self.terminals.close_session_shells(session_id).await;
        let subscribers = self.hub.remove_session(session_id).await;
        self.registries.lock().await.remove(session_id);
        debug!(session_id, shells, subscribers, "Released session resources");
    }

    /// Agent tools bound to a session.
    pub async fn toolbox(&self, session_id: &str) -> Result<Toolbox> {
        let session = self.sessions.lookup(session_id).await?;
        let registry = self
            .registries
            .lock()
            .await
            .entry(session.session_id.clone())
            .or_insert_with(|| Arc::new(RegistryStore::new(&session.workdir)))
            .clone();
        Ok(Toolbox::new(&session, self.exec.clone(), registry))
    }

    /// Runs a command in the session's sandbox, streaming its output to
    /// every subscriber of the session.
    pub async fn run_command(&self, session_id: &str, cmd: &str, tty: bool) -> Result<ExecOutput> {
        let session = self.sessions.lookup(session_id).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = self.hub.clone();
        let target = session_id.to_string();
        let forward = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                hub.broadcast(&target, message).await;
            }
        });

        let result = self
            .exec
            .run(
                &session.container_id,
                cmd,
                ExecMode::from_tty(tty),
                |chunk| {
                    let _ = tx.send(ServerMessage::CommandOutput {
                        stream: chunk.stream,
                        data: String::from_utf8_lossy(&chunk.data).into_owned(),
                    });
                },
            )
            .await;
        drop(tx);
        if let Err(e) = forward.await {
            warn!(session_id, error = %e, "Output forwarder failed");
        }

        let output = result?;
        self.hub
            .broadcast(
                session_id,
                ServerMessage::CommandFinished {
                    exit_code: output.exit_code,
                },
            )
            .await;
        Ok(output)
    }

    /// Subscribes a connection to a session's events after checking the
    /// session exists.
    pub async fn connect(&self, session_id: &str, connection: Connection) -> Result<ConnectionId> {
        self.sessions.lookup(session_id).await?;
        let id = connection.id();
        connection
            .send(ServerMessage::connection_established(session_id))
            .await;
        self.hub.subscribe(session_id, connection).await;
        info!(session_id, connection_id = id, "Connection subscribed");
        Ok(id)
    }

    /// Drops a subscription. Returns false if it was not registered.
    pub async fn disconnect(&self, session_id: &str, connection_id: ConnectionId) -> bool {
        self.hub.unsubscribe(session_id, connection_id).await
    }

    /// Forwards an agent-loop event to a session's subscribers.
    pub async fn publish(&self, session_id: &str, message: ServerMessage) -> usize {
        self.hub.broadcast(session_id, message).await
    }

    /// Raw conversation history of a session.
    pub async fn conversation(&self, session_id: &str) -> Result<Vec<ConversationEntry>> {
        Ok(self.sessions.lookup(session_id).await?.conversation_history)
    }

    /// Conversation history flattened to displayable messages.
    pub async fn transcript(&self, session_id: &str) -> Result<Vec<TranscriptMessage>> {
        let session = self.sessions.lookup(session_id).await?;
        Ok(transcript(&session.conversation_history))
    }

    /// Registers a shell for a live session without starting it.
    pub async fn create_shell(&self, session_id: &str) -> Result<ShellInfo> {
        let session = self.sessions.lookup(session_id).await?;
        Ok(self
            .terminals
            .create_shell(&session.session_id, &session.container_id)
            .await)
    }

    /// Resolves the command that enters the shell's sandbox.
    pub async fn start_shell(&self, shell_id: &str) -> Result<ShellInfo> {
        self.terminals.start_shell(shell_id).await
    }

    /// Spawns the shell on a pseudo-terminal and relays it to `attachment`.
    pub async fn attach_shell(
        &self,
        shell_id: &str,
        attachment: Attachment,
    ) -> Result<JoinHandle<()>> {
        self.terminals.attach(shell_id, attachment).await
    }

    /// Tears down the terminal of a shell but keeps its record.
    pub async fn close_shell(&self, shell_id: &str) -> Result<ShellInfo> {
        self.terminals.close_shell(shell_id).await
    }

    /// Closes a shell and forgets it.
    pub async fn delete_shell(&self, shell_id: &str) -> Result<()> {
        self.terminals.delete_shell(shell_id).await
    }

    /// Known shells, optionally only those of one session.
    pub async fn list_shells(&self, session_id: Option<&str>) -> Vec<ShellInfo> {
        self.terminals.list_shells(session_id).await
    }

    /// Probes the runtime and counts persisted sessions.
    pub async fn health(&self) -> HealthReport {
        let runtime = self.sessions.runtime();
        let runtime_available = match runtime.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Runtime is not reachable");
                false
            }
        };
        let active_sessions = match self.sessions.store().reload().await {
            Ok(sessions) => sessions.len(),
            Err(e) => {
                warn!(error = %e, "Failed to read session store");
                0
            }
        };
        HealthReport {
            status: if runtime_available { "healthy" } else { "degraded" },
            runtime: runtime.name(),
            runtime_available,
            active_sessions,
        }
    }
}
