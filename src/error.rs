//! Domain-specific error types for control-plane operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

/// Convenience alias used throughout the crate.
pub type Result<T, E = ControlError> = std::result::Result<T, E>;

/// Errors that can occur while managing sandboxes, processes and shells.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Sandbox could not be created or started.
    #[error("Failed to provision sandbox: {message}")]
    Provision { message: String },

    /// A session, shell, process or file does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A background command could not be started or its pid determined.
    #[error("Failed to launch background process: {message}")]
    Launch { message: String },

    /// A pid has no record in the process registry.
    #[error("pid {pid} not tracked")]
    NotTracked { pid: u32 },

    /// A command channel invocation failed at the runtime boundary.
    #[error("Command execution failed: {message}")]
    Exec { message: String },

    /// An interactive shell could not be opened.
    #[error("Failed to start shell: {message}")]
    Start { message: String },

    /// Descriptor-level failure while relaying a terminal.
    #[error("Terminal I/O failed: {message}")]
    Io { message: String },

    /// A shell already has a connection bound to it.
    #[error("Shell {shell_id} already has an attached connection")]
    AlreadyAttached { shell_id: String },

    /// A tool path resolved outside the session workspace.
    #[error("Path escapes the workspace: {path}")]
    OutsideWorkspace { path: String },

    /// A persisted store could not be read, parsed or written.
    #[error("Store {path} failed: {message}")]
    Store { path: String, message: String },
}

impl ControlError {
    /// Creates a `Provision` error.
    pub fn provision(message: impl Into<String>) -> Self {
        Self::Provision {
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error for the given kind of object.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates a `Launch` error.
    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch {
            message: message.into(),
        }
    }

    /// Creates an `Exec` error.
    pub fn exec(message: impl Into<String>) -> Self {
        Self::Exec {
            message: message.into(),
        }
    }

    /// Creates a `Start` error.
    pub fn start(message: impl Into<String>) -> Self {
        Self::Start {
            message: message.into(),
        }
    }

    /// Creates an `Io` error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates an `AlreadyAttached` error.
    pub fn already_attached(shell_id: impl Into<String>) -> Self {
        Self::AlreadyAttached {
            shell_id: shell_id.into(),
        }
    }

    /// Creates an `OutsideWorkspace` error.
    pub fn outside_workspace(path: impl Into<String>) -> Self {
        Self::OutsideWorkspace { path: path.into() }
    }

    /// Creates a `Store` error for the given file.
    pub fn store(path: &std::path::Path, message: impl std::fmt::Display) -> Self {
        Self::Store {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Returns true if this is a lookup failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::NotTracked { .. })
    }

    /// Returns true if this is a provisioning failure.
    pub fn is_provision(&self) -> bool {
        matches!(self, Self::Provision { .. })
    }

    /// Returns true if this is a command execution failure.
    pub fn is_exec(&self) -> bool {
        matches!(self, Self::Exec { .. })
    }

    /// Returns true if this is a shell start failure.
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start { .. })
    }
}
