use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ProcessRecord, ProcessStatus, RegistryStore, LOG_DIR};
use crate::error::{ControlError, Result};
use crate::exec::{ExecChannel, ExecMode};

/// Starts, stops and tails background commands in one sandbox.
pub struct ProcessRegistry {
    exec: ExecChannel,
    store: Arc<RegistryStore>,
    sandbox_id: String,
}

impl ProcessRegistry {
    pub fn new(exec: ExecChannel, store: Arc<RegistryStore>, sandbox_id: impl Into<String>) -> Self {
        Self {
            exec,
            store,
            sandbox_id: sandbox_id.into(),
        }
    }

    /// Launches `cmd` detached with its output redirected to a fresh log
    /// file, and records it as running.
    pub async fn start_process(&self, cmd: &str) -> Result<ProcessRecord> {
        let cmd = cmd.trim();
        if cmd.is_empty() {
            return Err(ControlError::launch("command cannot be empty"));
        }

        let log = format!("{LOG_DIR}/{}.log", uuid::Uuid::new_v4().simple());
        self.exec
            .capture(&self.sandbox_id, &format!("mkdir -p {LOG_DIR}"), ExecMode::Plain)
            .await
            .map_err(|e| ControlError::launch(format!("Failed to create log directory: {e}")))?;

        let launch = format!(
            "nohup {cmd} > {} 2>&1 & echo $!",
            shell_words::quote(&log)
        );
        let result = self
            .exec
            .capture(&self.sandbox_id, &launch, ExecMode::Plain)
            .await
            .map_err(|e| ControlError::launch(e.to_string()))?;
        let pid = parse_pid(&result.output)?;

        let record = ProcessRecord {
            pid,
            cmd: cmd.to_string(),
            log,
            started: Utc::now(),
            status: ProcessStatus::Running,
            ended: None,
        };
        self.store.append(record.clone()).await?;

        info!(pid, container_id = %self.sandbox_id, "Started background process: {}", cmd);
        Ok(record)
    }

    /// Sends SIGTERM to `pid` and marks its running records stopped.
    ///
    /// A pid that is unknown or already gone is not an error. Returns the
    /// number of records marked.
    pub async fn stop_process(&self, pid: u32) -> Result<usize> {
        self.exec
            .capture(
                &self.sandbox_id,
                &format!("kill -15 {pid} || true"),
                ExecMode::Plain,
            )
            .await?;
        let marked = self.store.mark_stopped(pid).await?;
        info!(pid, marked, "Sent SIGTERM to background process");
        Ok(marked)
    }

    /// Last `lines` lines of the log of `pid`.
    ///
    /// Works after the process was stopped; the log file is never removed.
    pub async fn tail_log(&self, pid: u32, lines: usize) -> Result<String> {
        let record = self
            .store
            .find(pid)
            .await?
            .ok_or(ControlError::NotTracked { pid })?;

        debug!(pid, log = %record.log, "Tailing log");
        let result = self
            .exec
            .capture(
                &self.sandbox_id,
                &format!("tail -n {lines} {} || true", shell_words::quote(&record.log)),
                ExecMode::Plain,
            )
            .await?;
        Ok(result.output)
    }

    /// Every record, including stopped ones.
    pub async fn list_processes(&self) -> Result<Vec<ProcessRecord>> {
        self.store.load().await
    }
}

/// Extracts the pid echoed by the launch wrapper from its output.
fn parse_pid(output: &str) -> Result<u32> {
    let last = output
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .ok_or_else(|| ControlError::launch("no pid in launch output"))?;

    match last.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(ControlError::launch(format!("unexpected launch output: {last}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerRuntime, HostRuntime, SandboxSpec};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    async fn registry() -> (ProcessRegistry, TempDir) {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(HostRuntime::default());
        let id = runtime
            .create_sandbox(&SandboxSpec {
                session_id: "procs".to_string(),
                workspace: dir.path().to_path_buf(),
            })
            .await
            .unwrap();
        let exec = ExecChannel::new(runtime, "/bin/bash");
        let store = Arc::new(RegistryStore::new(dir.path()));
        (ProcessRegistry::new(exec, store, id), dir)
    }

    async fn wait_for_log(registry: &ProcessRegistry, pid: u32, needle: &str) -> String {
        for _ in 0..100 {
            let log = registry.tail_log(pid, 5).await.unwrap();
            if log.contains(needle) {
                return log;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("log never contained {needle}");
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("1234\n").unwrap(), 1234);
        assert_eq!(parse_pid("noise\n  77  \n\n").unwrap(), 77);
        assert!(parse_pid("").is_err());
        assert!(parse_pid("not-a-pid").is_err());
        assert!(parse_pid("0").is_err());
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let (registry, dir) = registry().await;

        let started = registry.start_process("sleep 100").await.unwrap();
        assert!(started.pid > 0);
        assert!(started.log.starts_with(".agent_logs/"));
        assert!(dir.path().join(&started.log).exists());

        let records = registry.list_processes().await.unwrap();
        assert_eq!(records, vec![started.clone()]);

        registry.stop_process(started.pid).await.unwrap();
        let records = registry.list_processes().await.unwrap();
        assert_eq!(records.len(), 1);
        let stopped = &records[0];
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        assert!(stopped.ended.is_some());
        assert_eq!(stopped.pid, started.pid);
        assert_eq!(stopped.cmd, started.cmd);
        assert_eq!(stopped.log, started.log);
        assert_eq!(stopped.started, started.started);
    }

    #[tokio::test]
    async fn test_tail_log_survives_stop() {
        let (registry, _dir) = registry().await;
        let record = registry
            .start_process("bash -c 'echo Serving HTTP on 0.0.0.0 port 8000; sleep 100'")
            .await
            .unwrap();

        let log = wait_for_log(&registry, record.pid, "Serving HTTP").await;
        assert!(log.contains("port 8000"));

        registry.stop_process(record.pid).await.unwrap();
        let log = registry.tail_log(record.pid, 5).await.unwrap();
        assert!(log.contains("Serving HTTP"));
        let records = registry.list_processes().await.unwrap();
        assert_eq!(records[0].status, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_tail_untracked_pid() {
        let (registry, _dir) = registry().await;
        let err = registry.tail_log(424_242, 5).await.unwrap_err();
        assert!(matches!(err, ControlError::NotTracked { pid: 424_242 }));
    }

    #[tokio::test]
    async fn test_stop_unknown_pid_is_not_an_error() {
        let (registry, _dir) = registry().await;
        assert_eq!(registry.stop_process(424_242).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_command_is_launch_error() {
        let (registry, _dir) = registry().await;
        let err = registry.start_process("   ").await.unwrap_err();
        assert!(matches!(err, ControlError::Launch { .. }));
    }
}
