//! Run a command in a session's sandbox, streaming its output.

use anyhow::{bail, Result};
use colored::Colorize;
use std::io::Write;

use devbox::hub::{Connection, ServerMessage};
use devbox::runtime::StreamKind;
use devbox::ControlPlane;

pub fn format_exit(exit_code: Option<i64>) -> String {
    match exit_code {
        Some(0) => format!("{} exit 0", "✓".green()),
        Some(code) => format!("{} exit {code}", "✗".red()),
        None => format!("{} exit status unknown", "?".yellow()),
    }
}

/// Entry point: subscribes to the session and prints output as it arrives.
pub async fn run(control: &ControlPlane, session_id: &str, cmd: &str, tty: bool) -> Result<()> {
    let (connection, mut messages) = Connection::channel();
    let connection_id = control.connect(session_id, connection).await?;

    let printer = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            match message {
                ServerMessage::CommandOutput { stream, data } => {
                    if stream == StreamKind::Stderr {
                        eprint!("{data}");
                    } else {
                        print!("{data}");
                        let _ = std::io::stdout().flush();
                    }
                }
                ServerMessage::CommandFinished { .. } => break,
                _ => {}
            }
        }
    });

    let result = control.run_command(session_id, cmd, tty).await;
    control.disconnect(session_id, connection_id).await;
    let _ = printer.await;

    let output = result?;
    eprintln!("{}", format_exit(output.exit_code));
    if !output.success() {
        bail!("Command failed: {cmd}");
    }
    Ok(())
}
