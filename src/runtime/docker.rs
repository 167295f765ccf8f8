use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{
    ContainerRuntime, ExecChunk, ExecHandle, ExecRequest, SandboxSpec, SandboxStatus, ShellLaunch,
    StreamKind, MANAGED_LABEL,
};
use crate::config::SandboxConfig;
use crate::error::{ControlError, Result};

/// Seconds Docker waits for a graceful stop before killing the container.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Runs sandboxes as long-lived Docker containers.
pub struct DockerRuntime {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    ///
    /// The connection is lazy; use [`ContainerRuntime::ping`] to verify it.
    pub fn connect(config: SandboxConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            ControlError::provision(format!("Failed to connect to Docker. Is Docker running? {e}"))
        })?;
        Ok(Self { docker, config })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(|e| {
            ControlError::provision(format!("Cannot ping Docker daemon. Is Docker running? {e}"))
        })?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!("Image {} found locally", image);
                return Ok(());
            }
            Err(e) if is_missing(&e) => {}
            Err(e) => {
                return Err(ControlError::provision(format!(
                    "Failed to inspect image {image}: {e}"
                )))
            }
        }

        info!("Image {} not found locally, pulling...", image);
        let pull_options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(pull_options), None, None);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => {
                    if let Some(error) = output.error {
                        return Err(ControlError::provision(format!(
                            "Docker pull error for {image}: {error}"
                        )));
                    }
                    if let Some(status) = output.status {
                        debug!("pull {}: {}", image, status.trim());
                    }
                }
                Err(e) => {
                    return Err(ControlError::provision(format!(
                        "Error pulling image {image}: {e}"
                    )))
                }
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String> {
        let container_config = build_container_config(&self.config, spec)?;
        let name = format!("devbox-{}", spec.session_id);

        debug!("Creating container: {}", name);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| ControlError::provision(format!("Failed to create container: {e}")))?;

        for warning in &created.warnings {
            warn!("Docker warning for {}: {}", name, warning);
        }

        debug!("Starting container {}", created.id);
        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| ControlError::provision(format!("Failed to start container: {e}")))?;

        info!(container_id = %created.id, "Container started");
        Ok(created.id)
    }

    async fn sandbox_status(&self, id: &str) -> Result<Option<SandboxStatus>> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => {
                let status = response.state.and_then(|state| state.status);
                Ok(Some(map_status(status)))
            }
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(ControlError::exec(format!(
                "Failed to inspect container {id}: {e}"
            ))),
        }
    }

    async fn stop_sandbox(&self, id: &str) -> Result<()> {
        match self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) || is_not_modified(&e) => {
                debug!("Container {} already gone or stopped", id);
                Ok(())
            }
            Err(e) => Err(ControlError::exec(format!(
                "Failed to stop container {id}: {e}"
            ))),
        }
    }

    async fn start_exec(&self, id: &str, request: ExecRequest) -> Result<ExecHandle> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(request.cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(request.tty),
                    working_dir: Some(self.config.workdir.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ControlError::exec(format!("Failed to create exec: {e}")))?;

        let results = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ControlError::exec(format!("Failed to start exec: {e}")))?;

        let StartExecResults::Attached { output, .. } = results else {
            return Err(ControlError::exec("exec started detached"));
        };

        let output = output
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) => {
                        Some(Ok(ExecChunk::new(StreamKind::Stdout, message)))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        Some(Ok(ExecChunk::new(StreamKind::Stderr, message)))
                    }
                    Ok(LogOutput::Console { message }) => {
                        Some(Ok(ExecChunk::new(StreamKind::Console, message)))
                    }
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(ControlError::exec(format!(
                        "Error reading exec output: {e}"
                    )))),
                }
            })
            .boxed();

        Ok(ExecHandle {
            id: exec.id,
            output,
        })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| ControlError::exec(format!("Failed to inspect exec: {e}")))?;
        Ok(inspect.exit_code)
    }

    async fn shell_launch(&self, id: &str) -> Result<ShellLaunch> {
        match self.sandbox_status(id).await {
            Ok(Some(status)) if status.is_running() => {}
            Ok(Some(status)) => {
                return Err(ControlError::start(format!(
                    "container {id} is {status}, not running"
                )))
            }
            Ok(None) => return Err(ControlError::start(format!("container {id} not found"))),
            Err(e) => return Err(ControlError::start(e.to_string())),
        }

        Ok(ShellLaunch {
            program: "docker".to_string(),
            args: vec![
                "exec".to_string(),
                "-it".to_string(),
                "-w".to_string(),
                self.config.workdir.clone(),
                id.to_string(),
                self.config.shell.clone(),
            ],
            cwd: None,
        })
    }
}

/// Builds the container configuration for a session sandbox.
fn build_container_config(
    config: &SandboxConfig,
    spec: &SandboxSpec,
) -> Result<ContainerConfig<String>> {
    let workspace = spec.workspace.to_str().ok_or_else(|| {
        ControlError::provision(format!(
            "Invalid workspace path: {}",
            spec.workspace.display()
        ))
    })?;

    let binds = vec![format!("{}:{}:rw", workspace, config.workdir)];
    let labels = HashMap::from([(MANAGED_LABEL.to_string(), spec.session_id.clone())]);

    Ok(ContainerConfig {
        image: Some(config.image.clone()),
        cmd: Some(vec![config.shell.clone()]),
        tty: Some(true),
        open_stdin: Some(true),
        working_dir: Some(config.workdir.clone()),
        labels: Some(labels),
        host_config: Some(HostConfig {
            binds: Some(binds),
            network_mode: Some(config.network_mode.clone()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> SandboxStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => SandboxStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => SandboxStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => SandboxStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => SandboxStatus::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => SandboxStatus::Removing,
        Some(ContainerStateStatusEnum::EXITED) => SandboxStatus::Exited,
        Some(ContainerStateStatusEnum::DEAD) => SandboxStatus::Dead,
        _ => SandboxStatus::Unknown,
    }
}

fn is_missing(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            session_id: "a1b2c3d4".to_string(),
            workspace: PathBuf::from("/home/dev/agent_workspaces/session_a1b2c3d4"),
        }
    }

    #[test]
    fn test_container_config_mounts_workspace_rw() {
        let config = build_container_config(&SandboxConfig::default(), &spec()).unwrap();
        let host_config = config.host_config.unwrap();
        assert_eq!(
            host_config.binds.unwrap(),
            vec!["/home/dev/agent_workspaces/session_a1b2c3d4:/code:rw".to_string()]
        );
        assert_eq!(host_config.network_mode.as_deref(), Some("host"));
    }

    #[test]
    fn test_container_config_keeps_shell_alive() {
        let config = build_container_config(&SandboxConfig::default(), &spec()).unwrap();
        assert_eq!(config.cmd, Some(vec!["/bin/bash".to_string()]));
        assert_eq!(config.tty, Some(true));
        assert_eq!(config.working_dir.as_deref(), Some("/code"));
        assert_eq!(
            config.labels.unwrap().get(MANAGED_LABEL).map(String::as_str),
            Some("a1b2c3d4")
        );
    }

    #[test]
    fn test_map_status() {
        assert_eq!(
            map_status(Some(ContainerStateStatusEnum::RUNNING)),
            SandboxStatus::Running
        );
        assert_eq!(
            map_status(Some(ContainerStateStatusEnum::EXITED)),
            SandboxStatus::Exited
        );
        assert_eq!(map_status(None), SandboxStatus::Unknown);
    }

    #[test]
    fn test_is_missing() {
        let err = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(is_missing(&err));
        assert!(!is_not_modified(&err));
    }
}
