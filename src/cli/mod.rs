//! Command-line interface definitions for the `fleetroll` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `fleetroll` binary.
#[derive(Debug, Parser)]
#[command(
    name = "fleetroll",
    about = "Reconcile a cloud instance inventory and discover SSH credentials",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run one reconciliation cycle against the configured fleet.
    #[command(name = "roll", about = "Run one reconciliation cycle against the configured fleet")]
    Roll,
    /// Try SSH credentials against one host and report the outcome.
    #[command(
        name = "probe",
        about = "Try SSH credentials against one host and report the outcome"
    )]
    Probe(ProbeCommand),
    /// Print the stored inventory as JSON.
    #[command(name = "export", about = "Print the stored inventory as JSON")]
    Export(ExportCommand),
}

/// Arguments for the `fleetroll probe` subcommand.
///
/// Candidates are every `--user` combined with every `--key`, or every
/// `--user` with the `--password` when one is given. Exit codes: 0 success,
/// 1 authentication failure, 2 timeout, 3 connection refused, 5 or 6 name
/// resolution failure, 255 anything else.
#[derive(Debug, Parser)]
pub(crate) struct ProbeCommand {
    /// Host name or address to connect to.
    #[arg(long)]
    pub(crate) host: String,
    /// SSH port.
    #[arg(long, default_value_t = 22)]
    pub(crate) port: u16,
    /// Login user to try; repeat for several, tried in order.
    #[arg(long = "user", value_name = "USER")]
    pub(crate) users: Vec<String>,
    /// Private key file to try; repeat for several, tried in order.
    #[arg(long = "key", value_name = "PATH")]
    pub(crate) keys: Vec<String>,
    /// Password to try instead of keys.
    #[arg(long, env = "FLEETROLL_PROBE_PASSWORD", hide_env_values = true)]
    pub(crate) password: Option<String>,
}

/// Arguments for the `fleetroll export` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ExportCommand {
    /// Include instances already marked terminated.
    #[arg(long)]
    pub(crate) include_terminated: bool,
}
