//! Background process commands: ps, start, stop and logs.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use devbox::process::{ProcessRecord, ProcessStatus};
use devbox::ControlPlane;

pub fn format_processes(records: &[ProcessRecord]) -> String {
    let mut out = String::new();
    if records.is_empty() {
        let _ = writeln!(out, "\n{} No background processes.", "ℹ".blue());
        return out;
    }

    let _ = writeln!(
        out,
        "\n  {:<8} {:<8} {:<20} {}",
        "PID".bold(),
        "STATUS".bold(),
        "STARTED".bold(),
        "COMMAND".bold()
    );
    for record in records {
        let status = match record.status {
            ProcessStatus::Running => "running".green(),
            ProcessStatus::Stopped => "stopped".dimmed(),
        };
        let _ = writeln!(
            out,
            "  {:<8} {:<8} {:<20} {}",
            record.pid,
            status,
            record.started.format("%Y-%m-%d %H:%M:%S").to_string(),
            record.cmd
        );
    }
    out
}

pub fn format_started(record: &ProcessRecord) -> String {
    format!(
        "\n{} Started pid {}\n  Log: {}\n",
        "✓".green(),
        record.pid.to_string().cyan(),
        record.log.dimmed()
    )
}

pub fn format_stopped(pid: u32, marked: usize) -> String {
    if marked == 0 {
        format!("\n{} pid {pid} was not running\n", "ℹ".blue())
    } else {
        format!("\n{} Sent SIGTERM to pid {}\n", "✓".green(), pid.to_string().cyan())
    }
}

pub async fn run_ps(control: &ControlPlane, session_id: &str) -> Result<()> {
    let records = control.toolbox(session_id).await?.list_processes().await?;
    print!("{}", format_processes(&records));
    Ok(())
}

pub async fn run_start(control: &ControlPlane, session_id: &str, cmd: &str) -> Result<()> {
    let record = control.toolbox(session_id).await?.start_process(cmd).await?;
    print!("{}", format_started(&record));
    Ok(())
}

pub async fn run_stop(control: &ControlPlane, session_id: &str, pid: u32) -> Result<()> {
    let marked = control.toolbox(session_id).await?.stop_process(pid).await?;
    print!("{}", format_stopped(pid, marked));
    Ok(())
}

pub async fn run_logs(control: &ControlPlane, session_id: &str, pid: u32, lines: usize) -> Result<()> {
    let log = control.toolbox(session_id).await?.tail_log(pid, lines).await?;
    print!("{log}");
    Ok(())
}
