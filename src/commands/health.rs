use anyhow::{bail, Result};
use colored::Colorize;
use std::fmt::Write;

use devbox::control::HealthReport;
use devbox::ControlPlane;

pub fn format_health(report: &HealthReport) -> String {
    let mut out = String::new();
    let status = if report.is_healthy() {
        report.status.green().bold()
    } else {
        report.status.red().bold()
    };
    let reachable = if report.runtime_available {
        "reachable".green()
    } else {
        "unreachable".red()
    };
    let _ = writeln!(out, "\n  Status:     {status}");
    let _ = writeln!(out, "  Runtime:    {} ({reachable})", report.runtime.cyan());
    let _ = writeln!(
        out,
        "  Sessions:   {}",
        report.active_sessions.to_string().cyan()
    );
    out
}

pub async fn run(control: &ControlPlane) -> Result<()> {
    let report = control.health().await;
    print!("{}", format_health(&report));
    if !report.is_healthy() {
        bail!("{} runtime is not reachable", report.runtime);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_health() {
        let report = HealthReport {
            status: "degraded",
            runtime: "docker",
            runtime_available: false,
            active_sessions: 2,
        };
        let output = format_health(&report);
        assert!(output.contains("degraded"));
        assert!(output.contains("unreachable"));
        assert!(output.contains('2'));
    }
}
