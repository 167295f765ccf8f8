//! Operations an agent can invoke against its session.
//!
//! File tools act on the host side of the bind-mounted workspace; commands
//! and processes go through the sandbox.

mod advisory;
mod search;

pub use advisory::{analyze_error, Analysis, ErrorAnalysis, ErrorKind, PortReport};
pub use search::{
    DirectoryEntry, DirectoryListing, EntryType, FileSearch, GrepMatch, GrepSearch,
    DEFAULT_GREP_TYPES, MAX_FILE_MATCHES, MAX_GREP_MATCHES,
};

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{ControlError, Result};
use crate::exec::{ExecChannel, ExecMode, ExecOutput};
use crate::process::{ProcessRecord, ProcessRegistry, RegistryStore};
use crate::session::Session;

/// Default first port inspected by [`Toolbox::check_ports`].
pub const DEFAULT_PORT_START: u16 = 3000;

/// Default last port inspected by [`Toolbox::check_ports`].
pub const DEFAULT_PORT_END: u16 = 9000;

/// Tools bound to one session's workspace and sandbox.
pub struct Toolbox {
    session_id: String,
    workspace: PathBuf,
    sandbox_id: String,
    exec: ExecChannel,
    processes: ProcessRegistry,
}

impl Toolbox {
    /// Tools for `session`, recording processes in `registry`.
    pub fn new(session: &Session, exec: ExecChannel, registry: Arc<RegistryStore>) -> Self {
        let processes = ProcessRegistry::new(exec.clone(), registry, session.container_id.clone());
        Self {
            session_id: session.session_id.clone(),
            workspace: session.workdir.clone(),
            sandbox_id: session.container_id.clone(),
            exec,
            processes,
        }
    }

    /// Session these tools act on.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Host path of the workspace.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Maps a workspace-relative path to its host location.
    ///
    /// Absolute paths and any `..` that climbs above the workspace are
    /// rejected. The deepest part of the path that exists on disk must also
    /// resolve, symlinks followed, to a location inside the workspace.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut resolved = self.workspace.clone();
        let mut depth = 0usize;
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir if depth > 0 => {
                    resolved.pop();
                    depth -= 1;
                }
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ControlError::outside_workspace(path));
                }
            }
        }
        self.ensure_contained(&resolved, path)?;
        Ok(resolved)
    }

    /// Checks the real location of `target`, or of its deepest existing
    /// ancestor, against the real workspace root.
    fn ensure_contained(&self, target: &Path, path: &str) -> Result<()> {
        let root = std::fs::canonicalize(&self.workspace).map_err(|e| {
            ControlError::io(format!(
                "Failed to resolve workspace {}: {e}",
                self.workspace.display()
            ))
        })?;

        let mut candidate = target;
        loop {
            match std::fs::canonicalize(candidate) {
                Ok(real) if real.starts_with(&root) => return Ok(()),
                Ok(real) => {
                    debug!(path, real = %real.display(), "Path resolves outside workspace");
                    return Err(ControlError::outside_workspace(path));
                }
                // A dangling symlink would be followed on write
                Err(_) if std::fs::symlink_metadata(candidate).is_ok() => {
                    return Err(ControlError::outside_workspace(path));
                }
                Err(_) => match candidate.parent() {
                    Some(parent) if parent.starts_with(&self.workspace) => candidate = parent,
                    _ => return Err(ControlError::outside_workspace(path)),
                },
            }
        }
    }

    /// Creates or replaces a file, creating missing parent directories.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path)?;
        ensure_parent(&target).await?;
        fs::write(&target, content)
            .await
            .map_err(|e| ControlError::io(format!("Failed to write {path}: {e}")))?;
        info!(session_id = %self.session_id, path, bytes = content.len(), "Wrote file");
        Ok(())
    }

    /// Appends to a file, creating it and its parents when missing.
    pub async fn append_file(&self, path: &str, content: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let target = self.resolve(path)?;
        ensure_parent(&target).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .await
            .map_err(|e| ControlError::io(format!("Failed to open {path}: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| ControlError::io(format!("Failed to append to {path}: {e}")))?;
        debug!(session_id = %self.session_id, path, bytes = content.len(), "Appended to file");
        Ok(())
    }

    /// Reads a file as text, replacing invalid UTF-8.
    pub async fn read_file(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ControlError::not_found("file", path))
            }
            Err(e) => Err(ControlError::io(format!("Failed to read {path}: {e}"))),
        }
    }

    /// Runs a shell command in the sandbox and waits for it to finish.
    pub async fn run_shell(&self, cmd: &str, tty: bool) -> Result<ExecOutput> {
        self.exec
            .capture(&self.sandbox_id, cmd, ExecMode::from_tty(tty))
            .await
    }

    /// Starts `cmd` detached in the sandbox.
    pub async fn start_process(&self, cmd: &str) -> Result<ProcessRecord> {
        self.processes.start_process(cmd).await
    }

    /// Sends SIGTERM to a tracked process.
    pub async fn stop_process(&self, pid: u32) -> Result<usize> {
        self.processes.stop_process(pid).await
    }

    /// Last `lines` lines of a process log.
    pub async fn tail_log(&self, pid: u32, lines: usize) -> Result<String> {
        self.processes.tail_log(pid, lines).await
    }

    /// Every process recorded for this workspace.
    pub async fn list_processes(&self) -> Result<Vec<ProcessRecord>> {
        self.processes.list_processes().await
    }

    /// Lists a workspace directory, directories first.
    pub async fn list_directory(&self, path: &str) -> Result<DirectoryListing> {
        let dir = self.resolve(path)?;
        let display = display_path(path);
        blocking(move || search::list_directory(&dir, &display)).await
    }

    /// Finds files by wildcard name under `path`.
    pub async fn search_files(
        &self,
        pattern: &str,
        path: &str,
        file_types: Option<&str>,
    ) -> Result<FileSearch> {
        let dir = self.resolve(path)?;
        let root = self.workspace.clone();
        let pattern = pattern.to_string();
        let file_types = file_types.unwrap_or("*").to_string();
        blocking(move || search::search_files(&root, &dir, &pattern, &file_types)).await
    }

    /// Finds lines matching a regex under `path`.
    pub async fn grep_search(
        &self,
        pattern: &str,
        path: &str,
        file_types: Option<&str>,
    ) -> Result<GrepSearch> {
        let dir = self.resolve(path)?;
        let root = self.workspace.clone();
        let pattern = pattern.to_string();
        let file_types = file_types.unwrap_or(DEFAULT_GREP_TYPES).to_string();
        blocking(move || search::grep_search(&root, &dir, &pattern, &file_types)).await
    }

    /// Classifies an error message and suggests fixes.
    pub fn analyze_error(&self, error_text: &str, context: &str) -> ErrorAnalysis {
        analyze_error(error_text, context)
    }

    /// Reports listening ports inside the sandbox and suggests free ones.
    pub async fn check_ports(&self, start: u16, end: u16) -> Result<PortReport> {
        let listing = self
            .exec
            .capture(
                &self.sandbox_id,
                "netstat -tuln 2>/dev/null || ss -tuln 2>/dev/null || true",
                ExecMode::Plain,
            )
            .await?;
        Ok(PortReport::from_listing(&listing.output, start, end))
    }
}

async fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            ControlError::io(format!("Failed to create {}: {e}", parent.display()))
        })?;
    }
    Ok(())
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        ".".to_string()
    } else {
        path.to_string()
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ControlError::io(format!("Search task failed: {e}")))?
}
