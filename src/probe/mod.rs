//! Credential discovery against SSH endpoints.
//!
//! [`SshProbe`] walks an ordered candidate list, runs one handshake plus a
//! trivial check command per candidate through the system `ssh` client, and
//! stops at the first candidate whose session works. Every failed attempt is
//! reduced to a [`FailureReason`]; the report's terminal reason is the
//! highest-precedence reason observed.

mod classify;

use std::ffi::OsString;
use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Serialize, Serializer};
use tracing::debug;

use crate::command::{CommandError, CommandRunner, ProcessCommandRunner};

pub use classify::FailureReason;

/// Connection timeout applied to every handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wall-clock limit on one whole attempt: handshake, authentication and
/// the check command. `ssh` itself only bounds the TCP connect.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote command used to confirm a usable session.
pub const CHECK_COMMAND: &str = "ls -l /";

/// Environment variable `sshpass -e` reads the password from.
const SSHPASS_ENV: &str = "SSHPASS";

const REDACTED: &str = "<redacted>";

/// One (user, credential) pair to try.
#[derive(Clone, Eq, PartialEq, Serialize)]
pub struct Candidate {
    /// Login user.
    pub user: String,
    /// Private key file, for key authentication.
    pub key: Option<Utf8PathBuf>,
    /// Password, for password authentication.
    #[serde(serialize_with = "redact")]
    pub password: Option<String>,
}

impl Candidate {
    /// Candidate authenticating with a private key.
    #[must_use]
    pub fn with_key(user: impl Into<String>, key: impl Into<Utf8PathBuf>) -> Self {
        Self {
            user: user.into(),
            key: Some(key.into()),
            password: None,
        }
    }

    /// Candidate authenticating with a password.
    #[must_use]
    pub fn with_password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            key: None,
            password: Some(password.into()),
        }
    }

    fn credential(&self) -> Result<Credential<'_>, FailureReason> {
        if self.user.trim().is_empty() {
            return Err(FailureReason::configuration("candidate has an empty user"));
        }
        match (&self.key, &self.password) {
            (Some(key), None) => Ok(Credential::Key(key)),
            (None, Some(password)) => Ok(Credential::Password(password)),
            (Some(_), Some(_)) => Err(FailureReason::configuration(format!(
                "candidate {} supplies both a key and a password",
                self.user
            ))),
            (None, None) => Err(FailureReason::configuration(format!(
                "candidate {} supplies neither a key nor a password",
                self.user
            ))),
        }
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("user", &self.user)
            .field("key", &self.key)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .finish()
    }
}

fn redact<S: Serializer>(password: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match password {
        Some(_) => serializer.serialize_some(REDACTED),
        None => serializer.serialize_none(),
    }
}

enum Credential<'a> {
    Key(&'a Utf8PathBuf),
    Password(&'a str),
}

/// Outcome of a single attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Handshake and check command succeeded.
    Success,
    /// The attempt failed.
    Failure {
        /// Classified reason.
        reason: FailureReason,
        /// Raw error text preserved for diagnostics.
        raw_error: String,
    },
}

/// Record of one (user, credential) trial. Never persisted.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ConnectionAttempt {
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Key file tried, if any.
    pub key: Option<Utf8PathBuf>,
    /// What happened.
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl ConnectionAttempt {
    /// Classified reason when the attempt failed.
    #[must_use]
    pub const fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.outcome {
            AttemptOutcome::Success => None,
            AttemptOutcome::Failure { reason, .. } => Some(reason),
        }
    }
}

/// Result of probing one endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProbeReport {
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Candidate that opened a working session.
    pub chosen: Option<Candidate>,
    /// Terminal failure reason when no candidate succeeded.
    pub reason: Option<FailureReason>,
    /// Attempts in the order they were made.
    pub attempts: Vec<ConnectionAttempt>,
}

impl ProbeReport {
    fn configuration_failure(host: &str, port: u16, reason: FailureReason) -> Self {
        Self {
            host: host.to_owned(),
            port,
            chosen: None,
            reason: Some(reason),
            attempts: Vec::new(),
        }
    }

    /// Returns `true` when a candidate succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.chosen.is_some()
    }

    /// Process exit code for the standalone probe: `0` on success, otherwise
    /// the terminal reason's code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            return 0;
        }
        self.reason.as_ref().map_or(255, FailureReason::exit_code)
    }
}

/// Tries candidates against an endpoint and reports the first that works.
pub trait CredentialProbe: Send + Sync {
    /// Probes `host:port` with `candidates` in order.
    fn probe(&self, host: &str, port: u16, candidates: &[Candidate]) -> ProbeReport;
}

/// Binaries and files the SSH probe relies on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshProbeConfig {
    /// `ssh` client binary.
    pub ssh_bin: String,
    /// `sshpass` binary used for password candidates.
    pub sshpass_bin: String,
    /// Known-hosts file handed to `ssh`.
    pub known_hosts_file: String,
    /// Limit after which an attempt is killed and counted as a timeout.
    pub attempt_timeout: Duration,
}

impl Default for SshProbeConfig {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            sshpass_bin: String::from("sshpass"),
            known_hosts_file: String::from("/dev/null"),
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }
}

/// Credential probe driving the system `ssh` client.
#[derive(Clone, Debug)]
pub struct SshProbe<R: CommandRunner> {
    config: SshProbeConfig,
    runner: R,
}

impl SshProbe<ProcessCommandRunner> {
    /// Creates a probe that spawns real processes.
    #[must_use]
    pub const fn with_process_runner(config: SshProbeConfig) -> Self {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshProbe<R> {
    /// Creates a probe that routes invocations through `runner`.
    #[must_use]
    pub const fn new(config: SshProbeConfig, runner: R) -> Self {
        Self { config, runner }
    }

    fn ssh_args(&self, host: &str, port: u16, user: &str, credential: &Credential<'_>) -> Vec<OsString> {
        let mut options = vec![
            String::from("StrictHostKeyChecking=no"),
            format!("UserKnownHostsFile={}", self.config.known_hosts_file),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs()),
            format!("ServerAliveInterval={}", CONNECT_TIMEOUT.as_secs()),
            String::from("ServerAliveCountMax=1"),
            String::from("LogLevel=ERROR"),
        ];
        match credential {
            Credential::Key(_) => {
                options.push(String::from("BatchMode=yes"));
                options.push(String::from("IdentitiesOnly=yes"));
            }
            Credential::Password(_) => {
                options.push(String::from("BatchMode=no"));
                options.push(String::from("PubkeyAuthentication=no"));
                options.push(String::from(
                    "PreferredAuthentications=password,keyboard-interactive",
                ));
                options.push(String::from("NumberOfPasswordPrompts=1"));
            }
        }

        let mut args: Vec<OsString> = Vec::new();
        for option in options {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from("-p"));
        args.push(OsString::from(port.to_string()));
        if let Credential::Key(key) = credential {
            args.push(OsString::from("-i"));
            args.push(OsString::from(key.as_str()));
        }
        args.push(OsString::from("-l"));
        args.push(OsString::from(user));
        args.push(OsString::from("--"));
        args.push(OsString::from(host));
        args.push(OsString::from(CHECK_COMMAND));
        args
    }

    fn attempt(
        &self,
        host: &str,
        port: u16,
        candidate: &Candidate,
        credential: &Credential<'_>,
    ) -> ConnectionAttempt {
        let ssh_args = self.ssh_args(host, port, &candidate.user, credential);
        let limit = self.config.attempt_timeout;
        let (result, via_sshpass) = match credential {
            Credential::Key(_) => (
                self.runner
                    .run_with_env(&self.config.ssh_bin, &ssh_args, &[], Some(limit)),
                false,
            ),
            Credential::Password(password) => {
                let mut args = vec![
                    OsString::from("-e"),
                    OsString::from(self.config.ssh_bin.as_str()),
                ];
                args.extend(ssh_args);
                let env = [(String::from(SSHPASS_ENV), (*password).to_owned())];
                (
                    self.runner
                        .run_with_env(&self.config.sshpass_bin, &args, &env, Some(limit)),
                    true,
                )
            }
        };

        let outcome = match result {
            Ok(output) => match classify::classify(&output, via_sshpass) {
                None => AttemptOutcome::Success,
                Some(reason) => AttemptOutcome::Failure {
                    reason,
                    raw_error: output.stderr.trim().to_owned(),
                },
            },
            Err(err @ CommandError::TimedOut { .. }) => AttemptOutcome::Failure {
                reason: FailureReason::Timeout,
                raw_error: err.to_string(),
            },
            Err(err) => AttemptOutcome::Failure {
                reason: FailureReason::Unclassified {
                    detail: err.to_string(),
                },
                raw_error: err.to_string(),
            },
        };

        ConnectionAttempt {
            host: host.to_owned(),
            port,
            user: candidate.user.clone(),
            key: candidate.key.clone(),
            outcome,
        }
    }
}

impl<R: CommandRunner> CredentialProbe for SshProbe<R> {
    fn probe(&self, host: &str, port: u16, candidates: &[Candidate]) -> ProbeReport {
        if host.trim().is_empty() {
            return ProbeReport::configuration_failure(
                host,
                port,
                FailureReason::configuration("no host supplied"),
            );
        }
        if candidates.is_empty() {
            return ProbeReport::configuration_failure(
                host,
                port,
                FailureReason::configuration("no candidates supplied"),
            );
        }
        let credentials = match candidates
            .iter()
            .map(Candidate::credential)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(credentials) => credentials,
            Err(reason) => return ProbeReport::configuration_failure(host, port, reason),
        };

        let mut attempts = Vec::with_capacity(candidates.len());
        for (candidate, credential) in candidates.iter().zip(&credentials) {
            let attempt = self.attempt(host, port, candidate, credential);
            debug!(
                host,
                port,
                user = %candidate.user,
                reason = ?attempt.failure_reason(),
                "ssh attempt finished"
            );
            let succeeded = attempt.failure_reason().is_none();
            attempts.push(attempt);
            if succeeded {
                return ProbeReport {
                    host: host.to_owned(),
                    port,
                    chosen: Some(candidate.clone()),
                    reason: None,
                    attempts,
                };
            }
        }

        let reason = terminal_reason(&attempts);
        ProbeReport {
            host: host.to_owned(),
            port,
            chosen: None,
            reason,
            attempts,
        }
    }
}

/// Highest-precedence reason among failed attempts; earliest wins ties.
fn terminal_reason(attempts: &[ConnectionAttempt]) -> Option<FailureReason> {
    attempts
        .iter()
        .filter_map(ConnectionAttempt::failure_reason)
        .fold(None::<&FailureReason>, |best, reason| match best {
            Some(current) if current.precedence() >= reason.precedence() => Some(current),
            _ => Some(reason),
        })
        .cloned()
}

#[cfg(test)]
mod tests;
