//! One-shot command execution inside a sandbox.

use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::runtime::{ContainerRuntime, ExecChunk, ExecRequest};

/// How a command is attached to the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Pseudo-terminal allocated, login shell, one interleaved stream
    Interactive,
    /// No terminal, stdout and stderr demultiplexed
    Plain,
}

impl ExecMode {
    /// Interactive when `tty` is set.
    pub fn from_tty(tty: bool) -> Self {
        if tty {
            Self::Interactive
        } else {
            Self::Plain
        }
    }

    fn request(self, shell: &str, cmd: &str) -> ExecRequest {
        let (flag, tty) = match self {
            Self::Interactive => ("-lc", true),
            Self::Plain => ("-c", false),
        };
        ExecRequest {
            cmd: vec![shell.to_string(), flag.to_string(), cmd.to_string()],
            tty,
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    /// All output in capture order, decoded lossily as UTF-8
    pub output: String,
    /// Exit code, when the runtime reported one
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs commands to completion and streams their output.
///
/// Executions against one sandbox are not serialized; concurrent commands
/// may interleave their side effects.
#[derive(Clone)]
pub struct ExecChannel {
    runtime: Arc<dyn ContainerRuntime>,
    shell: String,
}

impl ExecChannel {
    /// Channel over `runtime` that runs command lines through `shell`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, shell: impl Into<String>) -> Self {
        Self {
            runtime,
            shell: shell.into(),
        }
    }

    /// Runs `cmd`, handing each chunk to `sink` as it arrives.
    ///
    /// There is no timeout; the call returns once the output stream drains.
    pub async fn run<F>(
        &self,
        sandbox_id: &str,
        cmd: &str,
        mode: ExecMode,
        mut sink: F,
    ) -> Result<ExecOutput>
    where
        F: FnMut(&ExecChunk) + Send,
    {
        debug!(container_id = %sandbox_id, ?mode, "$ {}", cmd);
        let mut handle = self
            .runtime
            .start_exec(sandbox_id, mode.request(&self.shell, cmd))
            .await?;

        let mut captured = Vec::new();
        while let Some(chunk) = handle.output.next().await {
            let chunk = chunk?;
            sink(&chunk);
            captured.extend_from_slice(&chunk.data);
        }

        let exit_code = self.runtime.exec_exit_code(&handle.id).await?;
        debug!(container_id = %sandbox_id, ?exit_code, "Command finished");

        Ok(ExecOutput {
            output: String::from_utf8_lossy(&captured).into_owned(),
            exit_code,
        })
    }

    /// Runs `cmd` and only returns the captured output.
    pub async fn capture(&self, sandbox_id: &str, cmd: &str, mode: ExecMode) -> Result<ExecOutput> {
        self.run(sandbox_id, cmd, mode, |_| {}).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{HostRuntime, SandboxSpec, StreamKind};
    use tempfile::tempdir;

    async fn setup() -> (ExecChannel, Arc<HostRuntime>, String, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(HostRuntime::default());
        let id = runtime
            .create_sandbox(&SandboxSpec {
                session_id: "exec".to_string(),
                workspace: dir.path().to_path_buf(),
            })
            .await
            .unwrap();
        let channel = ExecChannel::new(runtime.clone(), "/bin/bash");
        (channel, runtime, id, dir)
    }

    #[test]
    fn test_mode_builds_shell_command() {
        let interactive = ExecMode::Interactive.request("/bin/bash", "ls -la");
        assert_eq!(interactive.cmd, vec!["/bin/bash", "-lc", "ls -la"]);
        assert!(interactive.tty);

        let plain = ExecMode::from_tty(false).request("/bin/bash", "ls");
        assert_eq!(plain.cmd, vec!["/bin/bash", "-c", "ls"]);
        assert!(!plain.tty);
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let (channel, _runtime, id, _dir) = setup().await;
        let result = channel
            .capture(&id, "echo hello", ExecMode::Plain)
            .await
            .unwrap();
        assert!(result.output.contains("hello"));
        assert_eq!(result.exit_code, Some(0));
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let (channel, _runtime, id, _dir) = setup().await;
        let result = channel.capture(&id, "exit 3", ExecMode::Plain).await.unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_chunks_are_streamed_to_sink() {
        let (channel, _runtime, id, _dir) = setup().await;
        let mut seen = Vec::new();
        let result = channel
            .run(&id, "echo out; echo err >&2", ExecMode::Plain, |chunk| {
                seen.push(chunk.stream);
            })
            .await
            .unwrap();
        assert!(seen.contains(&StreamKind::Stdout));
        assert!(seen.contains(&StreamKind::Stderr));
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[tokio::test]
    async fn test_interactive_mode_uses_console_stream() {
        let (channel, _runtime, id, _dir) = setup().await;
        let mut kinds = Vec::new();
        channel
            .run(&id, "echo hi", ExecMode::Interactive, |chunk| kinds.push(chunk.stream))
            .await
            .unwrap();
        assert!(kinds.iter().all(|k| *k == StreamKind::Console));
    }

    #[tokio::test]
    async fn test_stopped_sandbox_is_exec_error() {
        let (channel, runtime, id, _dir) = setup().await;
        runtime.stop_sandbox(&id).await.unwrap();
        let err = channel
            .capture(&id, "echo hello", ExecMode::Plain)
            .await
            .unwrap_err();
        assert!(err.is_exec());
    }
}
