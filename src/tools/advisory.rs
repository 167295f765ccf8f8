//! Stateless helpers that hint at what went wrong or what to try next.

use serde::Serialize;

/// Maximum number of free ports suggested by a port check.
const MAX_SUGGESTED_PORTS: usize = 5;

/// Distance between suggested ports.
const PORT_SUGGESTION_STEP: usize = 100;

const HINTS: &[(&str, &str)] = &[
    (
        "permission denied",
        "Try using sudo or check file permissions with ls -la",
    ),
    (
        "command not found",
        "Install the missing package or check if it's in PATH",
    ),
    (
        "connection refused",
        "Check if the service is running and the port is correct",
    ),
    (
        "no such file or directory",
        "Verify the file path exists and check for typos",
    ),
    (
        "port already in use",
        "Use a different port or stop the conflicting process",
    ),
    (
        "address already in use",
        "Use a different port or stop the conflicting process",
    ),
    (
        "module not found",
        "Install the Python package with pip install",
    ),
    (
        "modulenotfounderror",
        "Install the Python package with pip install",
    ),
    (
        "npm err",
        "Try npm install or check package.json for issues",
    ),
];

const FALLBACK_HINT: &str = "Check logs and documentation for more details";

/// Coarse class of an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RuntimeError,
    Exception,
    Warning,
    Unknown,
}

/// Classification plus suggested fixes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analysis {
    pub error_type: ErrorKind,
    pub suggestions: Vec<String>,
}

/// Result of [`analyze_error`], echoing its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorAnalysis {
    pub analysis: Analysis,
    pub original_error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub context: String,
}

/// Classifies an error message and suggests fixes by keyword.
pub fn analyze_error(error_text: &str, context: &str) -> ErrorAnalysis {
    let lower = error_text.to_lowercase();

    let mut suggestions: Vec<String> = Vec::new();
    for (needle, hint) in HINTS {
        if lower.contains(needle) && !suggestions.iter().any(|s| s == hint) {
            suggestions.push((*hint).to_string());
        }
    }
    if suggestions.is_empty() {
        suggestions.push(FALLBACK_HINT.to_string());
    }

    let error_type = if lower.contains("error:") {
        ErrorKind::RuntimeError
    } else if lower.contains("exception") {
        ErrorKind::Exception
    } else if lower.contains("warning") {
        ErrorKind::Warning
    } else {
        ErrorKind::Unknown
    };

    ErrorAnalysis {
        analysis: Analysis {
            error_type,
            suggestions,
        },
        original_error: error_text.to_string(),
        context: context.to_string(),
    }
}

/// Listening ports seen in a range, and a few free ones to try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortReport {
    pub used_ports: Vec<u16>,
    pub suggested_ports: Vec<u16>,
    /// Inspected range as `start-end`
    pub range: String,
}

impl PortReport {
    /// Builds a report for `start..=end` from `netstat -tuln` style output.
    pub fn from_listing(listing: &str, start: u16, end: u16) -> Self {
        let used_ports = listening_ports(listing, start, end);
        let suggested_ports = (start..=end)
            .step_by(PORT_SUGGESTION_STEP)
            .filter(|port| used_ports.binary_search(port).is_err())
            .take(MAX_SUGGESTED_PORTS)
            .collect();
        Self {
            used_ports,
            suggested_ports,
            range: format!("{start}-{end}"),
        }
    }
}

/// Listening ports within `start..=end`, sorted and deduplicated.
fn listening_ports(listing: &str, start: u16, end: u16) -> Vec<u16> {
    let mut ports: Vec<u16> = listing
        .lines()
        .filter(|line| line.contains("LISTEN"))
        .filter_map(|line| {
            // First column shaped like host:port is the local address
            line.split_whitespace().find_map(|column| {
                let (_, port) = column.rsplit_once(':')?;
                port.parse::<u16>().ok()
            })
        })
        .filter(|port| (start..=end).contains(port))
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NETSTAT: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 0.0.0.0:3000            0.0.0.0:*               LISTEN
tcp        0      0 127.0.0.1:5432          0.0.0.0:*               LISTEN
tcp6       0      0 :::8000                 :::*                    LISTEN
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN
udp        0      0 0.0.0.0:5353            0.0.0.0:*
";

    #[test]
    fn test_analyze_permission_error() {
        let report = analyze_error("bash: ./run.sh: Permission denied", "");
        assert_eq!(report.analysis.error_type, ErrorKind::Unknown);
        assert_eq!(
            report.analysis.suggestions,
            vec!["Try using sudo or check file permissions with ls -la"]
        );
    }

    #[test]
    fn test_analyze_classifies_error_type() {
        assert_eq!(
            analyze_error("npm ERR! code E404\nError: not found", "").analysis.error_type,
            ErrorKind::RuntimeError
        );
        assert_eq!(
            analyze_error("Unhandled exception in thread main", "")
                .analysis
                .error_type,
            ErrorKind::Exception
        );
        assert_eq!(
            analyze_error("DeprecationWarning: use x instead", "")
                .analysis
                .error_type,
            ErrorKind::Warning
        );
    }

    #[test]
    fn test_analyze_dedups_and_falls_back() {
        let report = analyze_error("OSError: [Errno 98] Address already in use (port already in use)", "");
        assert_eq!(report.analysis.suggestions.len(), 1);

        let report = analyze_error("something odd happened", "while building");
        assert_eq!(report.analysis.suggestions, vec![FALLBACK_HINT]);
        assert_eq!(report.context, "while building");
    }

    #[test]
    fn test_port_report() {
        let report = PortReport::from_listing(NETSTAT, 3000, 9000);
        assert_eq!(report.used_ports, vec![3000, 5432, 8000]);
        assert_eq!(report.suggested_ports, vec![3100, 3200, 3300, 3400, 3500]);
        assert_eq!(report.range, "3000-9000");
    }

    #[test]
    fn test_port_report_small_range() {
        let report = PortReport::from_listing(NETSTAT, 7900, 8100);
        assert_eq!(report.used_ports, vec![8000]);
        assert_eq!(report.suggested_ports, vec![7900, 8100]);
    }
}
