//! Container runtime seam.
//!
//! Everything that touches a sandbox backend goes through [`ContainerRuntime`]:
//! provisioning, liveness probes, one-shot executions and the launch command
//! for interactive shells. Two backends exist:
//! - [`DockerRuntime`]: long-lived containers managed through the Docker API
//! - [`HostRuntime`]: workspace directories on the host, commands run via bash

mod docker;
mod host;

pub use docker::DockerRuntime;
pub use host::HostRuntime;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{RuntimeKind, SandboxConfig};
use crate::error::Result;

/// Label attached to every sandbox this control plane creates.
pub const MANAGED_LABEL: &str = "devbox.session";

/// What to provision for a new session.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Session that owns the sandbox.
    pub session_id: String,
    /// Host workspace, mounted read-write into the sandbox.
    pub workspace: PathBuf,
}

/// Observed state of a sandbox that still exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl SandboxStatus {
    /// Returns true if the sandbox can accept new executions.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A single command to run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Argument vector, executed without an implicit shell.
    pub cmd: Vec<String>,
    /// Allocate a pseudo-terminal (stdout and stderr interleave).
    pub tty: bool,
}

/// Which stream a chunk of execution output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Combined stream of a TTY execution
    Console,
}

/// A chunk of raw output from a running execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecChunk {
    pub stream: StreamKind,
    pub data: Bytes,
}

impl ExecChunk {
    /// Creates a chunk for the given stream.
    pub fn new(stream: StreamKind, data: impl Into<Bytes>) -> Self {
        Self {
            stream,
            data: data.into(),
        }
    }
}

/// A started execution: its runtime id and a stream of output chunks.
///
/// The stream ends once the command has finished writing output; the exit
/// code is available from [`ContainerRuntime::exec_exit_code`] afterwards.
pub struct ExecHandle {
    pub id: String,
    pub output: BoxStream<'static, Result<ExecChunk>>,
}

impl std::fmt::Debug for ExecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecHandle").field("id", &self.id).finish()
    }
}

/// Local command that attaches an interactive shell inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl std::fmt::Display for ShellLaunch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut words = vec![self.program.as_str()];
        words.extend(self.args.iter().map(String::as_str));
        f.write_str(&shell_words::join(words))
    }
}

/// Trait for sandbox backends.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the backend name for display.
    fn name(&self) -> &'static str;

    /// Verifies the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Makes sure the image is available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Creates and starts a long-lived sandbox, returning its id.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String>;

    /// Probes a sandbox. `None` means it no longer exists.
    async fn sandbox_status(&self, id: &str) -> Result<Option<SandboxStatus>>;

    /// Stops a sandbox. A sandbox that no longer exists is not an error.
    async fn stop_sandbox(&self, id: &str) -> Result<()>;

    /// Starts one execution with attached output.
    async fn start_exec(&self, id: &str, request: ExecRequest) -> Result<ExecHandle>;

    /// Exit code of a finished execution, if the runtime reported one.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>>;

    /// Local command that opens an interactive shell inside the sandbox.
    async fn shell_launch(&self, id: &str) -> Result<ShellLaunch>;
}

/// Directory under the base directory holding host sandbox records.
pub const HOST_STATE_DIR: &str = "host_sandboxes";

/// Builds the runtime selected by configuration. Host sandboxes are
/// recorded under `base_directory` so every process sees them.
pub fn connect(config: &SandboxConfig, base_directory: &Path) -> Result<Arc<dyn ContainerRuntime>> {
    match config.runtime {
        RuntimeKind::Docker => Ok(Arc::new(DockerRuntime::connect(config.clone())?)),
        RuntimeKind::Host => Ok(Arc::new(
            HostRuntime::new(config.shell.clone()).with_state_dir(base_directory.join(HOST_STATE_DIR)),
        )),
    }
}
