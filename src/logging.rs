//! Diagnostic logging setup for the binary.

use std::io;

use tracing_subscriber::{EnvFilter, fmt};

/// Installs a stderr subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Stdout stays reserved for command results. Calling this twice is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
    drop(installed);
}
