//! Tracing subscriber setup.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// File name prefix of the rolling log files.
const LOG_FILE_PREFIX: &str = "devbox.log";

/// Filter directive for the crate's own events.
fn directive(level: &str, verbose: bool) -> String {
    if verbose {
        "devbox=debug".to_string()
    } else {
        format!("devbox={level}")
    }
}

/// Installs the global subscriber.
///
/// Console output goes to stderr so command output on stdout stays clean.
/// When `config.directory` is set, events are also written as JSON to a
/// daily rolling file; keep the returned guard alive until exit so the file
/// writer is flushed.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(directive(&config.level, verbose))
        .with_context(|| format!("Invalid log level: {}", config.level))?;

    let console = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}
