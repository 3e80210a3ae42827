//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::fetch::{FetchError, FetchTarget, SnapshotFetcher};
use crate::instance::{Instance, RUNNING};
use crate::translate::{DescribeInstancesOutput, RawInstance, RawState, RawTag, Reservation};

/// Scripted command runner for deterministic command outcomes.
///
/// Responses come from sticky rules first (matched against the rendered
/// command line, in registration order), then from a FIFO queue, then from
/// an optional fallback. Clones share state, so a test can keep a handle
/// while the code under test owns another.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    rules: Vec<(String, Reply)>,
    responses: VecDeque<CommandOutput>,
    fallback: Option<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables passed to the program.
    pub env: Vec<(String, String)>,
    /// Time limit requested by the caller.
    pub limit: Option<Duration>,
}

#[derive(Clone, Debug)]
enum Reply {
    Output(CommandOutput),
    TimeOut,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Builds a [`CommandOutput`].
#[must_use]
pub fn output(code: Option<i32>, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.with_state(|state| state.invocations.clone())
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        let response = CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        };
        self.with_state(|state| state.responses.push_back(response));
    }

    /// Answers every invocation whose command line contains `needle`.
    pub fn respond_when(&self, needle: impl Into<String>, response: CommandOutput) {
        let rule = (needle.into(), Reply::Output(response));
        self.with_state(|state| state.rules.push(rule));
    }

    /// Makes every invocation whose command line contains `needle` overrun
    /// its time limit.
    pub fn time_out_when(&self, needle: impl Into<String>) {
        let rule = (needle.into(), Reply::TimeOut);
        self.with_state(|state| state.rules.push(rule));
    }

    /// Answers invocations that match no rule once the queue is empty.
    pub fn set_fallback(&self, response: CommandOutput) {
        self.with_state(|state| state.fallback = Some(response));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run_with_env(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
        limit: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            env: env.to_vec(),
            limit,
        };
        let line = invocation.command_string();
        self.with_state(|state| {
            state.invocations.push(invocation);
            let reply = state
                .rules
                .iter()
                .find(|(needle, _)| line.contains(needle.as_str()))
                .map(|(_, reply)| reply.clone())
                .or_else(|| state.responses.pop_front().map(Reply::Output))
                .or_else(|| state.fallback.clone().map(Reply::Output));
            match reply {
                Some(Reply::Output(output)) => Ok(output),
                Some(Reply::TimeOut) => Err(CommandError::TimedOut {
                    program: program.to_owned(),
                    limit: limit.unwrap_or_default(),
                }),
                None => Err(CommandError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                }),
            }
        })
    }
}

/// Snapshot fetcher returning canned listings per (account, region).
///
/// Pairs without a listing fail, which lets tests model a partial fetch.
/// Listings are kept in registration order; a later listing for the same
/// pair replaces the earlier one.
#[derive(Clone, Debug, Default)]
pub struct StaticFetcher {
    listings: Vec<Listing>,
}

#[derive(Clone, Debug)]
struct Listing {
    account: String,
    region: String,
    instances: Vec<RawInstance>,
}

impl StaticFetcher {
    /// Creates a fetcher with no listings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the listing returned for `account`/`region`.
    #[must_use]
    pub fn with_listing(mut self, account: &str, region: &str, instances: Vec<RawInstance>) -> Self {
        self.listings
            .retain(|listing| listing.account != account || listing.region != region);
        self.listings.push(Listing {
            account: account.to_owned(),
            region: region.to_owned(),
            instances,
        });
        self
    }
}

impl SnapshotFetcher for StaticFetcher {
    fn fetch(&self, target: &FetchTarget) -> Result<Vec<RawInstance>, FetchError> {
        self.listings
            .iter()
            .find(|listing| listing.account == target.account && listing.region == target.region)
            .map(|listing| listing.instances.clone())
            .ok_or_else(|| FetchError::CommandFailure {
                program: String::from("aws"),
                status: String::from("255"),
                stderr: format!(
                    "could not connect to the endpoint for {}/{}",
                    target.account, target.region
                ),
            })
    }
}

/// Fixed timestamp used by store and fixture clocks.
#[must_use]
pub fn fixed_clock() -> DateTime<Utc> {
    DateTime::from_timestamp(1_714_564_800, 0).unwrap_or_default()
}

/// Canonical running instance with deterministic field values.
#[must_use]
pub fn instance_fixture(id: &str) -> Instance {
    Instance {
        id: id.to_owned(),
        account: String::from("prod"),
        region: String::from("us-east-1"),
        cloud_provider: String::from("aws"),
        ami: String::from("ami-12345678"),
        name: String::from("web"),
        keypair_name: String::from("deploy"),
        launch_time: fixed_clock(),
        size: String::from("t3.micro"),
        subnet: String::from("subnet-1"),
        vpc: String::from("vpc-1"),
        state: String::from(RUNNING),
        os: String::from("linux"),
        private_ip: String::from("10.0.0.1"),
        public_ip: String::new(),
        ssh_key: String::new(),
        ssh_port: None,
        user: String::new(),
        env: String::from("production"),
        notes: String::new(),
        skip: false,
        tags: BTreeMap::new(),
        last_seen: None,
    }
}

/// Raw running descriptor with the given id and private address.
#[must_use]
pub fn raw_instance(id: &str, private_ip: &str) -> RawInstance {
    RawInstance {
        instance_id: id.to_owned(),
        image_id: String::from("ami-12345678"),
        launch_time: fixed_clock(),
        instance_type: Some(String::from("t3.micro")),
        key_name: Some(String::from("deploy")),
        subnet_id: Some(String::from("subnet-1")),
        vpc_id: Some(String::from("vpc-1")),
        private_ip_address: Some(private_ip.to_owned()),
        public_ip_address: None,
        platform_details: None,
        state: Some(RawState {
            name: String::from(RUNNING),
        }),
        tags: None,
    }
}

/// Returns `raw` with its tags replaced by `tags`.
#[must_use]
pub fn with_tags(raw: RawInstance, tags: &[(&str, &str)]) -> RawInstance {
    RawInstance {
        tags: Some(
            tags.iter()
                .map(|(key, value)| RawTag {
                    key: (*key).to_owned(),
                    value: (*value).to_owned(),
                })
                .collect(),
        ),
        ..raw
    }
}

/// Renders descriptors as an `aws ec2 describe-instances` JSON document.
#[must_use]
pub fn describe_json(instances: &[RawInstance]) -> String {
    let document = DescribeInstancesOutput {
        reservations: vec![Reservation {
            instances: instances.to_vec(),
        }],
    };
    serde_json::to_string(&document).unwrap_or_default()
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and removes environment variables while holding a global mutex.
    ///
    /// Every key in `remove` is unset for the lifetime of the guard, which
    /// keeps ambient developer settings out of configuration tests.
    pub async fn set_vars(pairs: &[(&str, &str)], remove: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs
                    .iter()
                    .map(|(key, _)| *key)
                    .chain(remove.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + remove.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }
        for key in remove {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
