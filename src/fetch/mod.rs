//! Fleet snapshot fetching through the `aws` CLI.
//!
//! One call lists every instance a single (account, region) pair reports.
//! Failures are scoped to that pair; the reconciler decides how to merge
//! partial results.

use std::ffi::OsString;
use std::time::Duration;

use thiserror::Error;

use crate::command::{CommandError, CommandRunner, ProcessCommandRunner};
use crate::translate::{DescribeInstancesOutput, Placement, RawInstance};

/// Wall-clock limit on one `describe-instances` call.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// One (account, region) pair to list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FetchTarget {
    /// CLI profile naming the account.
    pub account: String,
    /// Region to list.
    pub region: String,
    /// Logical environment recorded on every instance from this pair.
    pub env: String,
}

impl FetchTarget {
    /// Placement stamped on instances translated from this target.
    #[must_use]
    pub fn placement(&self) -> Placement {
        Placement {
            account: self.account.clone(),
            region: self.region.clone(),
            env: self.env.clone(),
        }
    }
}

/// Errors raised while listing one (account, region) pair.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The CLI binary could not be started.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// The CLI exited unsuccessfully.
    #[error("{program} exited with status {status}: {stderr}")]
    CommandFailure {
        /// Program that was invoked.
        program: String,
        /// Exit status rendered as text.
        status: String,
        /// Trimmed standard error.
        stderr: String,
    },
    /// The CLI output was not a valid instance listing.
    #[error("failed to parse instance listing: {message}")]
    Parse {
        /// Parser error text.
        message: String,
    },
}

/// Source of raw instance descriptors for one (account, region) pair.
pub trait SnapshotFetcher: Send + Sync {
    /// Lists every instance the provider currently reports for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the listing cannot be obtained or parsed.
    fn fetch(&self, target: &FetchTarget) -> Result<Vec<RawInstance>, FetchError>;
}

/// Snapshot fetcher that runs `aws ec2 describe-instances`.
#[derive(Clone, Debug)]
pub struct AwsCliFetcher<R: CommandRunner> {
    aws_bin: String,
    runner: R,
}

impl AwsCliFetcher<ProcessCommandRunner> {
    /// Creates a fetcher that spawns real processes.
    #[must_use]
    pub fn with_process_runner(aws_bin: impl Into<String>) -> Self {
        Self::new(aws_bin, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AwsCliFetcher<R> {
    /// Creates a fetcher that routes invocations through `runner`.
    #[must_use]
    pub fn new(aws_bin: impl Into<String>, runner: R) -> Self {
        Self {
            aws_bin: aws_bin.into(),
            runner,
        }
    }

    fn args(target: &FetchTarget) -> Vec<OsString> {
        [
            "ec2",
            "describe-instances",
            "--profile",
            target.account.as_str(),
            "--region",
            target.region.as_str(),
            "--output",
            "json",
        ]
        .into_iter()
        .map(OsString::from)
        .collect()
    }
}

impl<R: CommandRunner> SnapshotFetcher for AwsCliFetcher<R> {
    fn fetch(&self, target: &FetchTarget) -> Result<Vec<RawInstance>, FetchError> {
        let output =
            self.runner
                .run_with_env(&self.aws_bin, &Self::args(target), &[], Some(FETCH_TIMEOUT))?;
        if !output.is_success() {
            return Err(FetchError::CommandFailure {
                program: self.aws_bin.clone(),
                status: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            });
        }
        let listing: DescribeInstancesOutput =
            serde_json::from_str(&output.stdout).map_err(|err| FetchError::Parse {
                message: err.to_string(),
            })?;
        Ok(listing.into_instances())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::{fixture, rstest};

    #[fixture]
    fn target() -> FetchTarget {
        FetchTarget {
            account: String::from("prod"),
            region: String::from("eu-west-1"),
            env: String::from("production"),
        }
    }

    #[rstest]
    fn fetch_invokes_describe_instances_for_the_pair(target: FetchTarget) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), r#"{"Reservations": []}"#, "");
        let fetcher = AwsCliFetcher::new("aws", runner.clone());

        let instances = fetcher.fetch(&target).expect("fetch should succeed");

        assert!(instances.is_empty());
        let calls = runner.invocations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls.first().and_then(|call| call.limit), Some(FETCH_TIMEOUT));
        assert_eq!(
            calls.first().map(crate::test_support::CommandInvocation::command_string),
            Some(String::from(
                "aws ec2 describe-instances --profile prod --region eu-west-1 --output json"
            ))
        );
    }

    #[rstest]
    fn fetch_surfaces_cli_failures(target: FetchTarget) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(255), "", "An error occurred (AuthFailure)\n");
        let fetcher = AwsCliFetcher::new("aws", runner);

        let err = fetcher.fetch(&target).expect_err("non-zero exit must fail");

        match err {
            FetchError::CommandFailure { status, stderr, .. } => {
                assert_eq!(status, "255");
                assert_eq!(stderr, "An error occurred (AuthFailure)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    fn fetch_rejects_malformed_listing(target: FetchTarget) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "not json", "");
        let fetcher = AwsCliFetcher::new("aws", runner);

        assert!(matches!(
            fetcher.fetch(&target),
            Err(FetchError::Parse { .. })
        ));
    }

    #[rstest]
    fn overrunning_listing_is_a_command_error(target: FetchTarget) {
        let runner = ScriptedRunner::new();
        runner.time_out_when("describe-instances");
        let fetcher = AwsCliFetcher::new("aws", runner);

        assert!(matches!(
            fetcher.fetch(&target),
            Err(FetchError::Command(CommandError::TimedOut { .. }))
        ));
    }

    #[rstest]
    fn placement_copies_target_identity(target: FetchTarget) {
        let placement = target.placement();
        assert_eq!(placement.account, "prod");
        assert_eq!(placement.region, "eu-west-1");
        assert_eq!(placement.env, "production");
    }
}
