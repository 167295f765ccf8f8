use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use devbox::config::{Config, RuntimeKind};
use devbox::{logging, ControlPlane};

mod commands;

#[derive(Parser)]
#[command(name = "devbox")]
#[command(
    author,
    version,
    about = "Control plane for containerized agent development sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to devbox.toml in the base directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Sandbox backend: docker or host
    #[arg(long, global = true)]
    runtime: Option<RuntimeKind>,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a workspace and sandbox for a new session
    Create {
        /// Task the session is created for
        task: String,
    },

    /// List sessions, reconciling them with the runtime
    Sessions,

    /// Show one session and its conversation
    Show {
        session_id: String,
    },

    /// Stop a session's sandbox and forget it ("all" for every session)
    Cleanup {
        target: String,
    },

    /// Run a command in a session's sandbox
    Exec {
        session_id: String,

        /// Shell command line
        command: String,

        /// Run without a terminal, keeping stdout and stderr apart
        #[arg(long)]
        no_tty: bool,
    },

    /// List background processes of a session
    Ps {
        session_id: String,
    },

    /// Start a background process in a session's sandbox
    Start {
        session_id: String,

        /// Shell command line
        command: String,
    },

    /// Send SIGTERM to a background process
    Stop {
        session_id: String,
        pid: u32,
    },

    /// Show the tail of a background process log
    Logs {
        session_id: String,
        pid: u32,

        /// Number of lines
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Check runtime reachability and count sessions
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::resolve(cli.config.as_deref())?;
    if let Some(runtime) = cli.runtime {
        config.sandbox.runtime = runtime;
    }

    let _log_guard = logging::init(&config.logging, cli.verbose)?;

    let control = ControlPlane::open(config)
        .await
        .context("Failed to start control plane")?;

    match cli.command {
        Commands::Create { task } => {
            commands::session::run_create(&control, &task).await?;
        }
        Commands::Sessions => {
            commands::session::run_list(&control).await?;
        }
        Commands::Show { session_id } => {
            commands::session::run_show(&control, &session_id).await?;
        }
        Commands::Cleanup { target } => {
            commands::session::run_cleanup(&control, &target).await?;
        }
        Commands::Exec {
            session_id,
            command,
            no_tty,
        } => {
            commands::exec::run(&control, &session_id, &command, !no_tty).await?;
        }
        Commands::Ps { session_id } => {
            commands::process::run_ps(&control, &session_id).await?;
        }
        Commands::Start {
            session_id,
            command,
        } => {
            commands::process::run_start(&control, &session_id, &command).await?;
        }
        Commands::Stop { session_id, pid } => {
            commands::process::run_stop(&control, &session_id, pid).await?;
        }
        Commands::Logs {
            session_id,
            pid,
            lines,
        } => {
            commands::process::run_logs(&control, &session_id, pid, lines).await?;
        }
        Commands::Health => {
            commands::health::run(&control).await?;
        }
    }

    Ok(())
}
