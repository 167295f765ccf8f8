//! Background processes launched inside a sandbox.

mod registry;
mod store;

pub use registry::ProcessRegistry;
pub use store::RegistryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Directory, relative to the workspace, holding background process logs.
pub const LOG_DIR: &str = ".agent_logs";

/// Whether a background process is believed to be alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// One detached command started in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Pid inside the sandbox
    pub pid: u32,
    /// Command line as given
    pub cmd: String,
    /// Log file, relative to the workspace
    pub log: String,
    pub started: DateTime<Utc>,
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
}

impl ProcessRecord {
    /// Returns true until the process is stopped through the registry.
    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }
}
