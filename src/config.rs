use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "devbox.toml";

/// Top-level control plane configuration, loaded from `devbox.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where workspaces and the session store live on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Shared base directory holding every `session_<id>` workspace
    #[serde(default = "default_base_directory")]
    pub base_directory: PathBuf,

    /// Session store file name, relative to `base_directory`
    #[serde(default = "default_sessions_file")]
    pub sessions_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
            sessions_file: default_sessions_file(),
        }
    }
}

impl StorageConfig {
    /// Full path of the persisted session store.
    pub fn sessions_path(&self) -> PathBuf {
        self.base_directory.join(&self.sessions_file)
    }
}

/// Which backend hosts the sandboxes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker containers via the local daemon
    #[default]
    Docker,
    /// Plain host processes rooted in the workspace directory
    Host,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Host => write!(f, "host"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "host" => Ok(Self::Host),
            _ => anyhow::bail!("Unknown runtime: '{s}'. Supported: docker, host"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Sandbox backend
    #[serde(default)]
    pub runtime: RuntimeKind,

    /// Docker image to use
    #[serde(default = "default_image")]
    pub image: String,

    /// Mount point of the workspace inside the sandbox
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Docker network mode (host keeps sandbox ports reachable)
    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// Interactive shell started for terminals
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::default(),
            image: default_image(),
            workdir: default_workdir(),
            network_mode: default_network_mode(),
            shell: default_shell(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Initial PTY rows
    #[serde(default = "default_rows")]
    pub rows: u16,

    /// Initial PTY columns
    #[serde(default = "default_cols")]
    pub cols: u16,

    /// How long cleanup waits after SIGTERM before sending SIGKILL
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level for the devbox target
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,

    /// Directory for a daily rolling log file (disabled when unset)
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            directory: None,
        }
    }
}

// Default value functions
fn default_base_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("agent_workspaces")
}

fn default_sessions_file() -> String {
    "active_sessions.json".to_string()
}

fn default_image() -> String {
    "frdel/agent-zero-run:latest".to_string()
}

fn default_workdir() -> String {
    "/code".to_string()
}

fn default_network_mode() -> String {
    "host".to_string()
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `<dir>/devbox.toml`, using defaults if not found
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        Self::load_file(&config_path)
    }

    /// Load configuration from an explicit file, using defaults if not found
    pub fn load_file(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Effective configuration for a process: `explicit` if given, otherwise
    /// `devbox.toml` in the base directory, then environment overrides.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Self::load_file(path)?
            }
            None => {
                let base = std::env::var_os("DEVBOX_BASE_DIRECTORY")
                    .filter(|dir| !dir.is_empty())
                    .map_or_else(default_base_directory, PathBuf::from);
                Self::load(&base)?
            }
        };
        config.with_env_overrides()
    }

    /// Apply `DEVBOX_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Internal helper for env overrides with an explicit lookup.
    /// Enables testing without modifying the actual environment.
    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(dir) = value("DEVBOX_BASE_DIRECTORY") {
            self.storage.base_directory = PathBuf::from(dir);
        }
        if let Some(image) = value("DEVBOX_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(runtime) = value("DEVBOX_RUNTIME") {
            self.sandbox.runtime = runtime.parse()?;
        }
        if let Some(level) = value("DEVBOX_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sandbox.runtime, RuntimeKind::Docker);
        assert_eq!(config.sandbox.image, "frdel/agent-zero-run:latest");
        assert_eq!(config.sandbox.workdir, "/code");
        assert_eq!(config.sandbox.network_mode, "host");
        assert_eq!(config.terminal.rows, 24);
        assert_eq!(config.terminal.cols, 80);
        assert!(config
            .storage
            .sessions_path()
            .ends_with("agent_workspaces/active_sessions.json"));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[storage]
base_directory = "/srv/devbox"

[sandbox]
runtime = "host"
image = "ubuntu:24.04"

[terminal]
kill_grace_ms = 500

[logging]
json = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.base_directory, PathBuf::from("/srv/devbox"));
        assert_eq!(config.storage.sessions_file, "active_sessions.json");
        assert_eq!(config.sandbox.runtime, RuntimeKind::Host);
        assert_eq!(config.sandbox.image, "ubuntu:24.04");
        assert_eq!(config.sandbox.shell, "/bin/bash");
        assert_eq!(config.terminal.kill_grace_ms, 500);
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.runtime, RuntimeKind::Docker);
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[sandbox\nimage=").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }

    #[test]
    fn test_resolve_explicit_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[terminal]\nrows = 50\n").unwrap();
        let config = Config::resolve(Some(&path)).unwrap();
        assert_eq!(config.terminal.rows, 50);

        assert!(Config::resolve(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DEVBOX_BASE_DIRECTORY", "/var/lib/devbox"),
            ("DEVBOX_RUNTIME", "host"),
            ("DEVBOX_IMAGE", ""),
        ]
        .into_iter()
        .collect();

        let config = Config::default()
            .with_overrides_from(|k| env.get(k).map(ToString::to_string))
            .unwrap();

        assert_eq!(
            config.storage.base_directory,
            PathBuf::from("/var/lib/devbox")
        );
        assert_eq!(config.sandbox.runtime, RuntimeKind::Host);
        // Empty values are ignored
        assert_eq!(config.sandbox.image, "frdel/agent-zero-run:latest");
    }

    #[test]
    fn test_runtime_kind_parse() {
        assert_eq!("Docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Docker);
        assert_eq!("host".parse::<RuntimeKind>().unwrap(), RuntimeKind::Host);
        assert!("podman".parse::<RuntimeKind>().is_err());
    }
}
