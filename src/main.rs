//! Binary entry point for the fleetroll CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use fleetroll::{
    AwsCliFetcher, Candidate, ConfigError, CredentialProbe, FleetFile, FleetFileError,
    InventoryConfig, InventoryStore, ReconcileError, Reconciler, SqliteStore, SshProbe,
    StoreError, logging,
};

mod cli;

use cli::{Cli, ExportCommand, ProbeCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    FleetFile(#[from] FleetFileError),
    #[error("inventory store error: {0}")]
    Store(#[from] StoreError),
    #[error("reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Roll => roll_command().await,
        Cli::Probe(command) => probe_command(&command),
        Cli::Export(command) => export_command(&command),
    }
}

fn load_config() -> Result<InventoryConfig, CliError> {
    let config = InventoryConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

async fn roll_command() -> Result<i32, CliError> {
    let config = load_config()?;
    let fleet = FleetFile::load(Utf8Path::new(&config.fleet_file))?;
    let settings = fleet.cycle_settings(&config)?;
    let store = SqliteStore::open_and_init(Utf8Path::new(&config.database_path))?;
    let fetcher = AwsCliFetcher::with_process_runner(config.aws_bin.clone());
    let probe = SshProbe::with_process_runner(config.ssh_probe_config());

    let mut reconciler = Reconciler::new(store, fetcher, probe, settings);
    let summary = reconciler.run_cycle().await?;
    info!(
        new = summary.new_ids.len(),
        terminated = summary.terminated_ids.len(),
        "cycle committed"
    );
    print_json(&summary)?;
    Ok(0)
}

fn probe_command(args: &ProbeCommand) -> Result<i32, CliError> {
    let config = load_config()?;
    let probe = SshProbe::with_process_runner(config.ssh_probe_config());
    let candidates = probe_candidates(args);
    let report = probe.probe(&args.host, args.port, &candidates);
    print_json(&report)?;
    Ok(report.exit_code())
}

/// Every user with every key, then every user with the password. A user
/// given without any credential becomes a bare candidate, which the probe
/// rejects as a configuration failure.
fn probe_candidates(args: &ProbeCommand) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for user in &args.users {
        candidates.extend(
            args.keys
                .iter()
                .map(|key| Candidate::with_key(user.as_str(), key.as_str())),
        );
        if let Some(password) = &args.password {
            candidates.push(Candidate::with_password(user.as_str(), password.as_str()));
        }
        if args.keys.is_empty() && args.password.is_none() {
            candidates.push(Candidate {
                user: user.clone(),
                key: None,
                password: None,
            });
        }
    }
    candidates
}

fn export_command(args: &ExportCommand) -> Result<i32, CliError> {
    let config = load_config()?;
    let store = SqliteStore::open_and_init(Utf8Path::new(&config.database_path))?;
    let instances = store.list_instances(args.include_terminated)?;
    print_json(&instances)?;
    Ok(0)
}

fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    writeln!(io::stdout(), "{rendered}").ok();
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
