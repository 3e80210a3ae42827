//! Configuration loading via `ortho-config`.
//!
//! [`InventoryConfig`] holds the process-level settings: where the database
//! and the fleet description live, which binaries to shell out to, and how
//! wide the worker pools are. The fleet itself (accounts, candidates, tag
//! rules) lives in the fleet file, see [`crate::fleet_file`].

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::probe::SshProbeConfig;

/// Process-level settings merged from defaults, `fleetroll.toml` and
/// `FLEETROLL_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLEETROLL",
    discovery(
        app_name = "fleetroll",
        env_var = "FLEETROLL_CONFIG_PATH",
        config_file_name = "fleetroll.toml",
        dotfile_name = ".fleetroll.toml",
        project_file_name = "fleetroll.toml"
    )
)]
pub struct InventoryConfig {
    /// SQLite database holding the inventory.
    #[ortho_config(default = "inventory.db".to_owned())]
    pub database_path: String,
    /// TOML file describing accounts, regions and credential candidates.
    #[ortho_config(default = "fleet.toml".to_owned())]
    pub fleet_file: String,
    /// Path to the `aws` executable.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `sshpass` executable used for password candidates.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Known hosts file handed to `ssh`; probed hosts are new by definition.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Seconds after which one SSH attempt is killed and counted as a
    /// timeout.
    #[ortho_config(default = 10)]
    pub ssh_attempt_timeout_secs: u64,
    /// Concurrent (account, region) listings.
    #[ortho_config(default = 4)]
    pub fetch_workers: usize,
    /// Concurrent instance probes.
    #[ortho_config(default = 8)]
    pub probe_workers: usize,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to fleetroll.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl InventoryConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("fleetroll")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and configuration key that supply the value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a string setting is blank
    /// [`ConfigError::ZeroTimeout`] when the SSH attempt limit is zero
    /// and [`ConfigError::InvalidWorkers`] when a pool size is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            (
                &self.database_path,
                FieldMetadata::new(
                    "inventory database path",
                    "FLEETROLL_DATABASE_PATH",
                    "database_path",
                ),
            ),
            (
                &self.fleet_file,
                FieldMetadata::new("fleet file path", "FLEETROLL_FLEET_FILE", "fleet_file"),
            ),
            (
                &self.aws_bin,
                FieldMetadata::new("aws executable", "FLEETROLL_AWS_BIN", "aws_bin"),
            ),
            (
                &self.ssh_bin,
                FieldMetadata::new("ssh executable", "FLEETROLL_SSH_BIN", "ssh_bin"),
            ),
            (
                &self.sshpass_bin,
                FieldMetadata::new("sshpass executable", "FLEETROLL_SSHPASS_BIN", "sshpass_bin"),
            ),
            (
                &self.ssh_known_hosts_file,
                FieldMetadata::new(
                    "SSH known hosts file",
                    "FLEETROLL_SSH_KNOWN_HOSTS_FILE",
                    "ssh_known_hosts_file",
                ),
            ),
        ];
        for (value, metadata) in &fields {
            if value.trim().is_empty() {
                return Err(metadata.missing());
            }
        }
        if self.ssh_attempt_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                env_var: "FLEETROLL_SSH_ATTEMPT_TIMEOUT_SECS",
            });
        }
        if self.fetch_workers == 0 {
            return Err(ConfigError::InvalidWorkers {
                env_var: "FLEETROLL_FETCH_WORKERS",
            });
        }
        if self.probe_workers == 0 {
            return Err(ConfigError::InvalidWorkers {
                env_var: "FLEETROLL_PROBE_WORKERS",
            });
        }
        Ok(())
    }

    /// Probe settings derived from this configuration.
    #[must_use]
    pub fn ssh_probe_config(&self) -> SshProbeConfig {
        SshProbeConfig {
            ssh_bin: self.ssh_bin.clone(),
            sshpass_bin: self.sshpass_bin.clone(),
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            attempt_timeout: Duration::from_secs(self.ssh_attempt_timeout_secs),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("{0}")]
    MissingField(String),
    /// A worker pool was configured with zero workers.
    #[error("worker count must be at least 1: check {env_var} or fleetroll.toml")]
    InvalidWorkers {
        /// Environment variable controlling the pool.
        env_var: &'static str,
    },
    /// The SSH attempt limit was configured as zero seconds.
    #[error("SSH attempt timeout must be at least 1 second: check {env_var} or fleetroll.toml")]
    ZeroTimeout {
        /// Environment variable controlling the limit.
        env_var: &'static str,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
