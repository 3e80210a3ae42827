//! Core library for the fleetroll inventory reconciler.
//!
//! Each cycle lists every configured (account, region) pair through the
//! `aws` CLI, merges the listings into one snapshot, and reconciles it
//! against a SQLite inventory: new instances are recorded and probed for a
//! working SSH credential, known instances are refreshed, and instances that
//! disappeared are marked terminated. The credential probe is also usable on
//! its own against a single host.

pub mod command;
pub mod config;
pub mod fetch;
pub mod fleet_file;
pub mod instance;
pub mod keys;
pub mod logging;
pub mod probe;
pub mod reconcile;
pub mod store;
pub mod test_support;
pub mod translate;

pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, InventoryConfig};
pub use fetch::{AwsCliFetcher, FetchError, FetchTarget, SnapshotFetcher};
pub use fleet_file::{AccountEntry, FleetFile, FleetFileError};
pub use instance::Instance;
pub use probe::{
    AttemptOutcome, Candidate, ConnectionAttempt, CredentialProbe, FailureReason, ProbeReport,
    SshProbe, SshProbeConfig,
};
pub use reconcile::{
    CycleSettings, CycleSummary, FetchWarning, ProbeOutcome, ProbeStatus, ReconcileError,
    Reconciler,
};
pub use store::{InventoryStore, SqliteStore, StoreError};
pub use translate::{Placement, RawInstance, TagFilter, translate};
