//! Interactive terminals bridged to remote connections.
//!
//! Each shell moves through `created → started → attached → closed`:
//! - created: id allocated, nothing running
//! - started: the runtime handed out a launch command for the sandbox shell
//! - attached: the launch command runs on a local pseudo-terminal and two
//!   relay loops move bytes between it and the bound connection
//! - closed: the process group is gone and the terminal released
//!
//! Every exit path (explicit delete, remote disconnect, relay failure) ends in
//! the same cleanup routine, which runs at most once per shell.

mod pty;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TerminalConfig;
use crate::error::{ControlError, Result};
use crate::hub::{Attachment, ClientMessage, ConnectionHub, ServerMessage};
use crate::runtime::{ContainerRuntime, ShellLaunch};
use crate::session::short_id;
use pty::{read_loop, Pty, Utf8Decoder};

#[cfg(test)]
pub(crate) use pty::process_group_alive;

/// Lifecycle of a shell. Shells only move forward through these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellState {
    /// Registered, nothing resolved yet
    Created,
    /// Launch command resolved, no terminal running
    Started,
    /// Terminal running and relayed to a connection
    Attached,
    /// Terminal torn down
    Closed,
}

/// Snapshot of a shell for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellInfo {
    pub shell_id: String,
    pub session_id: String,
    pub sandbox_id: String,
    pub created: DateTime<Utc>,
    pub state: ShellState,
    /// Command used to enter the sandbox shell, once started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch: Option<String>,
    /// Process group of the local bridge process while attached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

struct ShellInner {
    state: ShellState,
    launch: Option<ShellLaunch>,
    pty: Option<Arc<Pty>>,
}

struct ShellSession {
    shell_id: String,
    session_id: String,
    sandbox_id: String,
    created: DateTime<Utc>,
    inner: Mutex<ShellInner>,
    closed: AtomicBool,
}

impl ShellSession {
    async fn info(&self) -> ShellInfo {
        let inner = self.inner.lock().await;
        ShellInfo {
            shell_id: self.shell_id.clone(),
            session_id: self.session_id.clone(),
            sandbox_id: self.sandbox_id.clone(),
            created: self.created,
            state: inner.state,
            launch: inner.launch.as_ref().map(ToString::to_string),
            pid: inner.pty.as_ref().and_then(|pty| pty.pid()),
        }
    }
}

/// Owns every interactive shell and its terminal resources.
pub struct TerminalBridge {
    runtime: Arc<dyn ContainerRuntime>,
    hub: Arc<ConnectionHub>,
    config: TerminalConfig,
    shells: Mutex<HashMap<String, Arc<ShellSession>>>,
}

impl TerminalBridge {
    /// Bridge over `runtime` that relays shell output through `hub`.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        hub: Arc<ConnectionHub>,
        config: TerminalConfig,
    ) -> Self {
        Self {
            runtime,
            hub,
            config,
            shells: Mutex::new(HashMap::new()),
        }
    }

    async fn shell(&self, shell_id: &str) -> Result<Arc<ShellSession>> {
        self.shells
            .lock()
            .await
            .get(shell_id)
            .cloned()
            .ok_or_else(|| ControlError::not_found("shell", shell_id))
    }

    /// Allocates a shell for a session's sandbox. Nothing is started yet.
    pub async fn create_shell(&self, session_id: &str, sandbox_id: &str) -> ShellInfo {
        let mut shells = self.shells.lock().await;
        let mut shell_id = short_id();
        while shells.contains_key(&shell_id) {
            shell_id = short_id();
        }

        let shell = Arc::new(ShellSession {
            shell_id: shell_id.clone(),
            session_id: session_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            created: Utc::now(),
            inner: Mutex::new(ShellInner {
                state: ShellState::Created,
                launch: None,
                pty: None,
            }),
            closed: AtomicBool::new(false),
        });
        shells.insert(shell_id.clone(), Arc::clone(&shell));
        drop(shells);

        info!(shell_id = %shell_id, session_id, "Shell created");
        shell.info().await
    }

    /// Obtains the launch command for the sandbox shell.
    ///
    /// On failure the shell stays `created`. Starting a started or attached
    /// shell is a no-op.
    pub async fn start_shell(&self, shell_id: &str) -> Result<ShellInfo> {
        let shell = self.shell(shell_id).await?;
        {
            let mut inner = shell.inner.lock().await;
            match inner.state {
                ShellState::Created => {
                    let launch = self
                        .runtime
                        .shell_launch(&shell.sandbox_id)
                        .await
                        .map_err(|e| match e {
                            ControlError::Start { .. } => e,
                            other => ControlError::start(other.to_string()),
                        })?;
                    debug!(shell_id, "Shell launch: {}", launch);
                    inner.launch = Some(launch);
                    inner.state = ShellState::Started;
                }
                ShellState::Started | ShellState::Attached => {}
                ShellState::Closed => return Err(ControlError::not_found("shell", shell_id)),
            }
        }
        Ok(shell.info().await)
    }

    /// Binds a connection to a shell and starts relaying.
    ///
    /// A `created` shell is started first. Returns the relay task, which
    /// finishes once the shell has been cleaned up.
    pub async fn attach(
        self: &Arc<Self>,
        shell_id: &str,
        attachment: Attachment,
    ) -> Result<JoinHandle<()>> {
        self.start_shell(shell_id).await?;
        let shell = self.shell(shell_id).await?;

        let mut inner = shell.inner.lock().await;
        let launch = match (inner.state, inner.launch.clone()) {
            (ShellState::Attached, _) => return Err(ControlError::already_attached(shell_id)),
            (ShellState::Closed, _) | (_, None) => {
                return Err(ControlError::not_found("shell", shell_id))
            }
            (_, Some(launch)) => launch,
        };

        let (pty, reader) = Pty::spawn(&launch, self.config.rows, self.config.cols)?;
        let pty = Arc::new(pty);

        let Attachment {
            connection,
            inbound,
        } = attachment;
        if let Err(e) = self.hub.bind_shell(shell_id, connection).await {
            pty.terminate(self.kill_grace()).await;
            return Err(e);
        }

        inner.pty = Some(Arc::clone(&pty));
        inner.state = ShellState::Attached;
        drop(inner);

        info!(shell_id, pid = ?pty.pid(), "Shell attached");
        let bridge = Arc::clone(self);
        Ok(tokio::spawn(async move {
            bridge.relay(shell, pty, reader, inbound).await;
        }))
    }

    async fn relay(
        &self,
        shell: Arc<ShellSession>,
        pty: Arc<Pty>,
        reader: Box<dyn std::io::Read + Send>,
        mut inbound: mpsc::Receiver<ClientMessage>,
    ) {
        let shell_id = shell.shell_id.clone();
        let (bytes_tx, mut bytes_rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::task::spawn_blocking(move || read_loop(reader, bytes_tx));

        let terminal_to_remote = async {
            let mut decoder = Utf8Decoder::default();
            while let Some(bytes) = bytes_rx.recv().await {
                let data = decoder.decode(&bytes);
                if data.is_empty() {
                    continue;
                }
                if !self
                    .hub
                    .send_to_shell(&shell_id, ServerMessage::Output { data })
                    .await
                {
                    return "connection closed";
                }
            }
            let rest = decoder.finish();
            if !rest.is_empty() {
                self.hub
                    .send_to_shell(&shell_id, ServerMessage::Output { data: rest })
                    .await;
            }
            "terminal closed"
        };

        let remote_to_terminal = async {
            while let Some(message) = inbound.recv().await {
                match message {
                    ClientMessage::Input { data } => {
                        if let Err(e) = pty.write(data.into_bytes()).await {
                            warn!(shell_id = %shell_id, "{}", e);
                            return "write failed";
                        }
                    }
                    ClientMessage::Resize { rows, cols } => {
                        match pty.resize(rows, cols) {
                            Ok(()) => debug!(shell_id = %shell_id, rows, cols, "Terminal resized"),
                            Err(e) => warn!(shell_id = %shell_id, "{}", e),
                        }
                    }
                    ClientMessage::Unknown => {
                        debug!(shell_id = %shell_id, "Ignoring unknown client message");
                    }
                }
            }
            "connection closed"
        };

        let reason = tokio::select! {
            reason = terminal_to_remote => reason,
            reason = remote_to_terminal => reason,
        };
        info!(shell_id = %shell_id, reason, "Relay finished");

        self.cleanup(&shell).await;
    }

    fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.config.kill_grace_ms)
    }

    /// Releases a shell's process group, terminal and connection. Runs at
    /// most once per shell; returns false if it already ran.
    async fn cleanup(&self, shell: &ShellSession) -> bool {
        if shell.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let pty = shell.inner.lock().await.pty.take();
        if let Some(pty) = pty {
            pty.terminate(self.kill_grace()).await;
        }

        if let Some(connection) = self.hub.unbind_shell(&shell.shell_id).await {
            connection.try_send(ServerMessage::Exit {
                shell_id: shell.shell_id.clone(),
            });
        }

        shell.inner.lock().await.state = ShellState::Closed;
        info!(shell_id = %shell.shell_id, "Shell closed");
        true
    }

    /// Cleans up a shell but keeps it listed as `closed`. Calling it again is
    /// a no-op.
    pub async fn close_shell(&self, shell_id: &str) -> Result<ShellInfo> {
        let shell = self.shell(shell_id).await?;
        self.cleanup(&shell).await;
        Ok(shell.info().await)
    }

    /// Cleans up a shell and forgets it.
    pub async fn delete_shell(&self, shell_id: &str) -> Result<()> {
        let shell = self
            .shells
            .lock()
            .await
            .remove(shell_id)
            .ok_or_else(|| ControlError::not_found("shell", shell_id))?;
        self.cleanup(&shell).await;
        Ok(())
    }

    /// Deletes every shell of a session. Returns how many were removed.
    pub async fn close_session_shells(&self, session_id: &str) -> usize {
        let removed: Vec<Arc<ShellSession>> = {
            let mut shells = self.shells.lock().await;
            let ids: Vec<String> = shells
                .values()
                .filter(|shell| shell.session_id == session_id)
                .map(|shell| shell.shell_id.clone())
                .collect();
            ids.iter().filter_map(|id| shells.remove(id)).collect()
        };
        for shell in &removed {
            self.cleanup(shell).await;
        }
        removed.len()
    }

    /// Snapshot of one shell.
    pub async fn get_shell(&self, shell_id: &str) -> Result<ShellInfo> {
        Ok(self.shell(shell_id).await?.info().await)
    }

    /// Every shell, optionally restricted to one session, oldest first.
    pub async fn list_shells(&self, session_id: Option<&str>) -> Vec<ShellInfo> {
        let shells: Vec<Arc<ShellSession>> = self
            .shells
            .lock()
            .await
            .values()
            .filter(|shell| session_id.is_none_or(|id| shell.session_id == id))
            .cloned()
            .collect();

        let mut infos = Vec::with_capacity(shells.len());
        for shell in shells {
            infos.push(shell.info().await);
        }
        infos.sort_by(|a, b| a.created.cmp(&b.created));
        infos
    }
}
