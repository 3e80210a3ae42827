//! Failure taxonomy and stderr classification for SSH attempts.

use std::fmt;

use serde::Serialize;

use crate::command::CommandOutput;

/// Exit status `ssh` reserves for its own (connection-level) errors.
const SSH_ERROR_STATUS: i32 = 255;

/// Exit status `sshpass` uses when the password was rejected.
const SSHPASS_BAD_PASSWORD: i32 = 5;

const AUTH_MARKERS: &[&str] = &[
    "permission denied",
    "authentication failed",
    "invalid credentials",
    "unable to authenticate",
    "no supported methods remain",
    "too many authentication failures",
    "incorrect password",
];
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout"];
const REFUSED_MARKERS: &[&str] = &["connection refused"];
const TEMPORARY_RESOLUTION_MARKERS: &[&str] = &["temporary failure in name resolution"];
const RESOLUTION_MARKERS: &[&str] = &[
    "could not resolve hostname",
    "name or service not known",
    "nodename nor servname",
    "no such host",
    "no address associated",
];

/// Classified reason for a failed probe or attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The server rejected the credential.
    Authentication,
    /// The connection did not complete within the timeout.
    Timeout,
    /// The host actively refused the connection.
    ConnectionRefused,
    /// The host name could not be resolved.
    NameResolution {
        /// `true` when the resolver reported a transient failure.
        temporary: bool,
    },
    /// Any other failure, including a session whose check command failed.
    Unclassified {
        /// Diagnostic text.
        detail: String,
    },
    /// The probe was invoked without a usable candidate; no I/O happened.
    Configuration {
        /// What was wrong with the input.
        detail: String,
    },
}

impl FailureReason {
    /// Process exit code reported by the standalone probe.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Authentication => 1,
            Self::Timeout => 2,
            Self::ConnectionRefused => 3,
            Self::NameResolution { temporary: false } => 5,
            Self::NameResolution { temporary: true } => 6,
            Self::Unclassified { .. } | Self::Configuration { .. } => 255,
        }
    }

    /// Rank used to pick the terminal reason; higher wins.
    #[must_use]
    pub const fn precedence(&self) -> u8 {
        match self {
            Self::Authentication => 4,
            Self::Timeout => 3,
            Self::ConnectionRefused => 2,
            Self::NameResolution { .. } => 1,
            Self::Unclassified { .. } | Self::Configuration { .. } => 0,
        }
    }

    pub(super) fn configuration(detail: impl Into<String>) -> Self {
        Self::Configuration {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => f.write_str("authentication failure"),
            Self::Timeout => f.write_str("timeout"),
            Self::ConnectionRefused => f.write_str("connection refused"),
            Self::NameResolution { temporary: false } => f.write_str("name resolution failure"),
            Self::NameResolution { temporary: true } => {
                f.write_str("temporary name resolution failure")
            }
            Self::Unclassified { detail } => write!(f, "unclassified failure: {detail}"),
            Self::Configuration { detail } => write!(f, "configuration failure: {detail}"),
        }
    }
}

fn contains_any(haystack: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| haystack.contains(marker))
}

/// Classifies one finished `ssh` (or `sshpass`) run.
///
/// Returns `None` when the handshake and the check command both succeeded.
pub(super) fn classify(output: &CommandOutput, via_sshpass: bool) -> Option<FailureReason> {
    let stderr = output.stderr.to_lowercase();
    match output.code {
        Some(0) => None,
        Some(SSHPASS_BAD_PASSWORD) if via_sshpass => Some(FailureReason::Authentication),
        Some(SSH_ERROR_STATUS) => Some(classify_stderr(&stderr).unwrap_or_else(|| {
            FailureReason::Unclassified {
                detail: describe(output),
            }
        })),
        Some(code) => Some(FailureReason::Unclassified {
            detail: format!("check command exited with status {code}"),
        }),
        None => Some(FailureReason::Unclassified {
            detail: describe(output),
        }),
    }
}

/// Matches connection-level error text against the taxonomy, highest
/// precedence first.
pub(super) fn classify_stderr(stderr: &str) -> Option<FailureReason> {
    if contains_any(stderr, AUTH_MARKERS) {
        Some(FailureReason::Authentication)
    } else if contains_any(stderr, TIMEOUT_MARKERS) {
        Some(FailureReason::Timeout)
    } else if contains_any(stderr, REFUSED_MARKERS) {
        Some(FailureReason::ConnectionRefused)
    } else if contains_any(stderr, TEMPORARY_RESOLUTION_MARKERS) {
        Some(FailureReason::NameResolution { temporary: true })
    } else if contains_any(stderr, RESOLUTION_MARKERS) {
        Some(FailureReason::NameResolution { temporary: false })
    } else {
        None
    }
}

fn describe(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("ssh exited with status {}", output.status_text())
    } else {
        stderr.to_owned()
    }
}
