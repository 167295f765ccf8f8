//! Host-process runtime.
//!
//! A "sandbox" here is just a workspace directory on the host; executions run
//! as child processes rooted in it. There is no isolation. With a state
//! directory, each sandbox is recorded in `<state_dir>/<id>.json` so later
//! processes see the same sandboxes. Useful for:
//! - Testing the control plane without Docker
//! - Running on machines where a container daemon is not available

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ContainerRuntime, ExecChunk, ExecHandle, ExecRequest, SandboxSpec, SandboxStatus, ShellLaunch,
    StreamKind,
};
use crate::error::{ControlError, Result};

type ExitCodes = Arc<Mutex<HashMap<String, Option<i64>>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HostSandbox {
    workspace: PathBuf,
    status: SandboxStatus,
}

/// Runs sandbox commands directly on the host, inside the workspace directory.
#[derive(Debug)]
pub struct HostRuntime {
    shell: String,
    state_dir: Option<PathBuf>,
    sandboxes: Mutex<HashMap<String, HostSandbox>>,
    exit_codes: ExitCodes,
}

impl HostRuntime {
    /// Creates a runtime whose interactive shells use `shell`.
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            state_dir: None,
            sandboxes: Mutex::new(HashMap::new()),
            exit_codes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Persists sandbox records under `dir`.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Forgets a sandbox entirely, as if it was removed out-of-band.
    pub fn remove_sandbox(&self, id: &str) -> bool {
        let cached = self
            .sandboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        let persisted = self
            .record_path(id)
            .is_some_and(|path| std::fs::remove_file(path).is_ok());
        cached || persisted
    }

    /// Location of a sandbox record. Only ids this runtime hands out map to
    /// a file.
    fn record_path(&self, id: &str) -> Option<PathBuf> {
        let dir = self.state_dir.as_ref()?;
        let suffix = id.strip_prefix("host-")?;
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(dir.join(format!("{id}.json")))
    }

    async fn lookup(&self, id: &str) -> Result<Option<HostSandbox>> {
        let cached = self
            .sandboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let Some(path) = self.record_path(id) else {
            return Ok(None);
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ControlError::store(&path, e)),
        };
        match serde_json::from_str::<HostSandbox>(&content) {
            Ok(sandbox) => {
                self.sandboxes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.to_string(), sandbox.clone());
                Ok(Some(sandbox))
            }
            Err(e) => {
                warn!(sandbox_id = id, "Ignoring unreadable sandbox record: {}", e);
                Ok(None)
            }
        }
    }

    async fn persist(&self, id: &str, sandbox: &HostSandbox) -> Result<()> {
        let Some(path) = self.record_path(id) else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ControlError::store(&path, e))?;
        }
        let content = serde_json::to_string_pretty(sandbox).map_err(|e| ControlError::store(&path, e))?;
        write_atomic(&path, content).await
    }

    async fn running_workspace(
        &self,
        id: &str,
    ) -> Result<Option<std::result::Result<PathBuf, SandboxStatus>>> {
        Ok(self.lookup(id).await?.map(|sandbox| {
            if sandbox.status.is_running() {
                Ok(sandbox.workspace)
            } else {
                Err(sandbox.status)
            }
        }))
    }
}

async fn write_atomic(path: &Path, content: String) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| ControlError::store(path, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ControlError::store(path, e))
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new("/bin/bash")
    }
}

#[async_trait]
impl ContainerRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        debug!("host runtime ignores image {}", image);
        Ok(())
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String> {
        if !spec.workspace.is_dir() {
            return Err(ControlError::provision(format!(
                "workspace {} does not exist",
                spec.workspace.display()
            )));
        }

        let id = format!("host-{}", uuid::Uuid::new_v4().simple());
        let sandbox = HostSandbox {
            workspace: spec.workspace.clone(),
            status: SandboxStatus::Running,
        };
        self.persist(&id, &sandbox).await?;
        self.sandboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), sandbox);
        debug!(sandbox_id = %id, session_id = %spec.session_id, "Created host sandbox");
        Ok(id)
    }

    async fn sandbox_status(&self, id: &str) -> Result<Option<SandboxStatus>> {
        Ok(self.lookup(id).await?.map(|sandbox| sandbox.status))
    }

    async fn stop_sandbox(&self, id: &str) -> Result<()> {
        let Some(mut sandbox) = self.lookup(id).await? else {
            return Ok(());
        };
        sandbox.status = SandboxStatus::Exited;
        self.persist(id, &sandbox).await?;
        self.sandboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), sandbox);
        Ok(())
    }

    async fn start_exec(&self, id: &str, request: ExecRequest) -> Result<ExecHandle> {
        let workspace = match self.running_workspace(id).await? {
            Some(Ok(workspace)) => workspace,
            Some(Err(status)) => {
                return Err(ControlError::exec(format!("sandbox {id} is {status}")))
            }
            None => return Err(ControlError::exec(format!("sandbox {id} not found"))),
        };

        let (program, args) = request
            .cmd
            .split_first()
            .ok_or_else(|| ControlError::exec("command cannot be empty"))?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ControlError::exec(format!("Failed to spawn {program}: {e}")))?;

        let (out_kind, err_kind) = if request.tty {
            (StreamKind::Console, StreamKind::Console)
        } else {
            (StreamKind::Stdout, StreamKind::Stderr)
        };

        let exec_id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let exit_codes = Arc::clone(&self.exit_codes);
        let key = exec_id.clone();

        tokio::spawn(async move {
            tokio::join!(
                pump(stdout, out_kind, tx.clone()),
                pump(stderr, err_kind, tx.clone()),
            );
            let code = child
                .wait()
                .await
                .ok()
                .and_then(|status| status.code())
                .map(i64::from);
            exit_codes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, code);
            // Stream ends only once the exit code is recorded
            drop(tx);
        });

        let output = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(ExecHandle {
            id: exec_id,
            output,
        })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let mut codes = self.exit_codes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(codes.remove(exec_id).flatten())
    }

    async fn shell_launch(&self, id: &str) -> Result<ShellLaunch> {
        match self.running_workspace(id).await? {
            Some(Ok(workspace)) => Ok(ShellLaunch {
                program: self.shell.clone(),
                args: Vec::new(),
                cwd: Some(workspace),
            }),
            Some(Err(status)) => Err(ControlError::start(format!("sandbox {id} is {status}"))),
            None => Err(ControlError::start(format!("sandbox {id} not found"))),
        }
    }
}

/// Forwards one child pipe into the output channel until EOF.
async fn pump<R>(
    reader: Option<R>,
    stream: StreamKind,
    tx: mpsc::UnboundedSender<Result<ExecChunk>>,
) where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = ExecChunk::new(stream, Bytes::copy_from_slice(&buf[..n]));
                if tx.send(Ok(chunk)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(ControlError::exec(format!("read failed: {e}"))));
                break;
            }
        }
    }
}
