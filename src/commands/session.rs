//! Session commands: create, list, show and cleanup.
//!
//! Formatting is pure; the `run_*` functions do the IO.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use devbox::session::{Session, SessionStatus, SessionView, Speaker, TranscriptMessage};
use devbox::ControlPlane;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Target of a cleanup: one session or every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupTarget {
    All,
    Session(String),
}

impl CleanupTarget {
    pub fn parse(target: &str) -> Self {
        if target == "all" {
            Self::All
        } else {
            Self::Session(target.to_string())
        }
    }
}

pub fn format_created(session: &Session) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "\n{} Session {} created",
        "✓".green(),
        session.session_id.cyan().bold()
    );
    let _ = writeln!(out, "  Workspace:  {}", session.workdir.display());
    let _ = writeln!(out, "  Sandbox:    {}", short(&session.container_id).dimmed());
    out
}

pub fn format_sessions(sessions: &[SessionView]) -> String {
    let mut out = String::new();
    if sessions.is_empty() {
        let _ = writeln!(out, "\n{} No active sessions.", "ℹ".blue());
        let _ = writeln!(out, "  Run {} to create one.", "devbox create <task>".green());
        return out;
    }

    let _ = writeln!(out, "\n{}", "━".repeat(60).dimmed());
    let _ = writeln!(
        out,
        "  {:<10} {:<8} {:<10} {:<21} {}",
        "SESSION".bold(),
        "STATUS".bold(),
        "SANDBOX".bold(),
        "CREATED".bold(),
        "LAST TASK".bold()
    );
    for view in sessions {
        let session = &view.session;
        let _ = writeln!(
            out,
            "  {:<10} {:<8} {:<10} {:<21} {}",
            session.session_id.cyan(),
            status_label(session.status),
            view.sandbox_status.to_string(),
            session.created.format(TIME_FORMAT).to_string(),
            truncate(&session.last_task, 40).dimmed()
        );
    }
    let _ = writeln!(out, "{}", "━".repeat(60).dimmed());
    out
}

pub fn format_session(view: &SessionView, messages: &[TranscriptMessage]) -> String {
    let session = &view.session;
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "━".repeat(60).dimmed());
    let _ = writeln!(
        out,
        "{}",
        format!("   Session {}", session.session_id).yellow().bold()
    );
    let _ = writeln!(out, "{}", "━".repeat(60).dimmed());
    let _ = writeln!(out, "  Status:     {}", status_label(session.status));
    let _ = writeln!(out, "  Sandbox:    {} ({})", short(&session.container_id).cyan(), view.sandbox_status);
    let _ = writeln!(out, "  Workspace:  {}", session.workdir.display().to_string().cyan());
    let _ = writeln!(
        out,
        "  Created:    {}",
        session.created.format(TIME_FORMAT).to_string().cyan()
    );
    if let Some(last) = session.last_activity {
        let _ = writeln!(
            out,
            "  Activity:   {}",
            last.format(TIME_FORMAT).to_string().cyan()
        );
    }
    if !session.last_task.is_empty() {
        let _ = writeln!(out, "  Last task:  {}", session.last_task.cyan());
    }

    if !messages.is_empty() {
        let _ = writeln!(out, "\n  {}", "Conversation".bold());
        for message in messages {
            let speaker = match message.speaker {
                Speaker::Human => "user".green(),
                Speaker::Ai => "ai".magenta(),
            };
            let _ = writeln!(out, "  {speaker:>5} │ {}", truncate(&message.content, 100));
        }
    }
    let _ = writeln!(out, "{}", "━".repeat(60).dimmed());
    out
}

pub fn format_cleanup(target: &CleanupTarget, removed: usize) -> String {
    match target {
        CleanupTarget::All => format!("\n{} Cleaned up {removed} session(s)\n", "✓".green()),
        CleanupTarget::Session(id) => {
            format!("\n{} Cleaned up session {}\n", "✓".green(), id.cyan())
        }
    }
}

fn status_label(status: SessionStatus) -> colored::ColoredString {
    match status {
        SessionStatus::Active => "active".green().bold(),
        SessionStatus::Stale => "stale".red(),
    }
}

fn short(container_id: &str) -> &str {
    container_id.get(..12).unwrap_or(container_id)
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max {
        let cut: String = line.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    } else {
        line.to_string()
    }
}

pub async fn run_create(control: &ControlPlane, task: &str) -> Result<()> {
    let session = control.create_session(task).await?;
    print!("{}", format_created(&session));
    Ok(())
}

pub async fn run_list(control: &ControlPlane) -> Result<()> {
    let sessions = control.list_sessions().await?;
    print!("{}", format_sessions(&sessions));
    Ok(())
}

pub async fn run_show(control: &ControlPlane, session_id: &str) -> Result<()> {
    let view = control.get_session(session_id).await?;
    let messages = control.transcript(session_id).await?;
    print!("{}", format_session(&view, &messages));
    Ok(())
}

pub async fn run_cleanup(control: &ControlPlane, target: &str) -> Result<()> {
    let target = CleanupTarget::parse(target);
    let removed = match &target {
        CleanupTarget::All => control.cleanup_all().await?,
        CleanupTarget::Session(id) => {
            control.cleanup_session(id).await?;
            1
        }
    };
    print!("{}", format_cleanup(&target, removed));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use devbox::runtime::SandboxStatus;
    use std::path::PathBuf;

    fn view(status: SessionStatus) -> SessionView {
        SessionView {
            session: Session {
                session_id: "a1b2c3d4".to_string(),
                container_id: "0123456789abcdef0123".to_string(),
                workdir: PathBuf::from("/tmp/session_a1b2c3d4"),
                created: Utc::now(),
                last_task: "build a flask app\nwith tests".to_string(),
                last_activity: None,
                conversation_history: Vec::new(),
                status,
            },
            sandbox_status: SandboxStatus::Running,
        }
    }

    #[test]
    fn test_cleanup_target_parse() {
        assert_eq!(CleanupTarget::parse("all"), CleanupTarget::All);
        assert_eq!(
            CleanupTarget::parse("a1b2c3d4"),
            CleanupTarget::Session("a1b2c3d4".to_string())
        );
    }

    #[test]
    fn test_format_sessions_empty() {
        let output = format_sessions(&[]);
        assert!(output.contains("No active sessions"));
    }

    #[test]
    fn test_format_sessions_lists_each_session() {
        let output = format_sessions(&[view(SessionStatus::Active)]);
        assert!(output.contains("a1b2c3d4"));
        assert!(output.contains("running"));
        assert!(output.contains("build a flask app"));
        assert!(!output.contains("with tests"));
    }

    #[test]
    fn test_format_session_shows_transcript() {
        let messages = vec![TranscriptMessage {
            speaker: Speaker::Ai,
            content: "Server written.".to_string(),
            id: "ai-0".to_string(),
        }];
        let output = format_session(&view(SessionStatus::Stale), &messages);
        assert!(output.contains("Session a1b2c3d4"));
        assert!(output.contains("0123456789ab"));
        assert!(output.contains("Server written."));
    }

    #[test]
    fn test_format_cleanup() {
        assert!(format_cleanup(&CleanupTarget::All, 3).contains("3 session(s)"));
        assert!(format_cleanup(&CleanupTarget::Session("a1b2c3d4".to_string()), 1)
            .contains("a1b2c3d4"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
        assert_eq!(truncate("", 5), "");
    }
}
