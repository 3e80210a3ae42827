//! Process execution seam shared by the snapshot fetcher and the probe.
//!
//! Both collaborators shell out to system binaries (`aws`, `ssh`,
//! `sshpass`). Routing every call through [`CommandRunner`] keeps them
//! testable with scripted outputs instead of real processes.

use std::ffi::OsString;
use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit status for diagnostics.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Raised when a command cannot be run to completion.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// The process could not be started or waited on.
    #[error("failed to run {program}: {message}")]
    Spawn {
        /// Command that failed.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The process outlived its time limit and was killed.
    #[error("{program} did not finish within {}s", limit.as_secs())]
    TimedOut {
        /// Command that was killed.
        program: String,
        /// Limit that expired.
        limit: Duration,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with extra environment variables, capturing output.
    ///
    /// When `limit` is set the process is killed once it has run that long.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started and
    /// [`CommandError::TimedOut`] when `limit` expires.
    fn run_with_env(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
        limit: Option<Duration>,
    ) -> Result<CommandOutput, CommandError>;

    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.run_with_env(program, args, &[], None)
    }
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl CommandRunner for ProcessCommandRunner {
    fn run_with_env(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
        limit: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .envs(env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null());
        match limit {
            Some(bound) => run_bounded(command, program, bound),
            None => {
                let output = command.output().map_err(|err| spawn_error(program, &err))?;
                Ok(CommandOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
        }
    }
}

fn spawn_error(program: &str, err: &io::Error) -> CommandError {
    CommandError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}

/// Polls the child until it exits or `limit` passes, then kills it.
///
/// Pipes are drained on their own threads so a chatty child cannot block on
/// a full pipe. After a kill the readers are left detached: a grandchild
/// (`ssh` under `sshpass`) may still hold the write ends.
fn run_bounded(
    mut command: Command,
    program: &str,
    limit: Duration,
) -> Result<CommandOutput, CommandError> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(program, &err))?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|err| spawn_error(program, &err))?
        {
            break status;
        }
        if started.elapsed() >= limit {
            child.kill().ok();
            child.wait().ok();
            return Err(CommandError::TimedOut {
                program: program.to_owned(),
                limit,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        code: status.code(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            reader.read_to_end(&mut buffer).ok();
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn args(items: &[&str]) -> Vec<OsString> {
        items.iter().map(OsString::from).collect()
    }

    #[rstest]
    fn bounded_run_captures_output() {
        let output = ProcessCommandRunner
            .run_with_env(
                "sh",
                &args(&["-c", "echo out; echo err >&2; exit 3"]),
                &[],
                Some(Duration::from_secs(10)),
            )
            .expect("sh should run");

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[rstest]
    fn overrunning_process_is_killed() {
        let started = Instant::now();
        let err = ProcessCommandRunner
            .run_with_env(
                "sleep",
                &args(&["30"]),
                &[],
                Some(Duration::from_millis(300)),
            )
            .expect_err("sleep must be cut short");

        assert!(
            matches!(err, CommandError::TimedOut { ref program, .. } if program == "sleep"),
            "unexpected error: {err}"
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[rstest]
    fn environment_reaches_the_child() {
        let output = ProcessCommandRunner
            .run_with_env(
                "sh",
                &args(&["-c", "printf %s \"$FLEETROLL_MARKER\""]),
                &[(String::from("FLEETROLL_MARKER"), String::from("set"))],
                None,
            )
            .expect("sh should run");

        assert_eq!(output.stdout, "set");
    }

    #[rstest]
    fn missing_binary_is_a_spawn_error() {
        let err = ProcessCommandRunner
            .run("/nonexistent/fleetroll-binary", &[])
            .expect_err("binary does not exist");
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
