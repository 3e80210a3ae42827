//! Fleet description file: accounts, regions, candidates and tag rules.
//!
//! The file is TOML and is read once at startup. Everything the reconciler
//! needs is derived from it here, so the core only ever receives validated
//! values.
//!
//! ```toml
//! default_regions = ["us-east-1"]
//! users = ["ubuntu", "ec2-user"]
//! key_dir = "~/ansible/keys"
//!
//! [[accounts]]
//! profile = "prod"
//! env = "production"
//! regions = ["us-east-1", "eu-west-1"]
//! ```

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use serde::Deserialize;
use thiserror::Error;

use crate::config::InventoryConfig;
use crate::fetch::FetchTarget;
use crate::keys::{KeyDirError, discover_keys, expand_tilde};
use crate::probe::Candidate;
use crate::reconcile::CycleSettings;
use crate::translate::TagFilter;

/// Errors raised while loading or validating the fleet file.
#[derive(Debug, Error)]
pub enum FleetFileError {
    /// The file could not be read.
    #[error("failed to read fleet file {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// The file is not valid TOML for the fleet schema.
    #[error("failed to parse fleet file {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// The file parsed but describes an unusable fleet.
    #[error("invalid fleet file: {0}")]
    Invalid(String),
    /// The key directory could not be listed.
    #[error(transparent)]
    KeyDir(#[from] KeyDirError),
}

/// One cloud account.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AccountEntry {
    /// CLI profile naming the account.
    pub profile: String,
    /// Logical environment recorded on its instances.
    #[serde(default)]
    pub env: String,
    /// Regions to list; falls back to `default_regions` when empty.
    #[serde(default)]
    pub regions: Vec<String>,
}

/// Parsed fleet file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FleetFile {
    /// Accounts to reconcile.
    pub accounts: Vec<AccountEntry>,
    /// Regions used by accounts that list none.
    pub default_regions: Vec<String>,
    /// Candidate login users, in trial order.
    pub users: Vec<String>,
    /// Explicit private key paths, in trial order.
    pub keys: Vec<String>,
    /// Directory scanned for additional private keys.
    pub key_dir: Option<String>,
    /// Key file names never offered as candidates.
    pub key_blacklist: Vec<String>,
    /// Tag keys an instance must carry to be tracked.
    pub required_tags: Vec<String>,
    /// Tag keys dropped before persistence.
    pub ignored_tags: Vec<String>,
    /// Platform description to OS name rewrites.
    pub os_map: BTreeMap<String, String>,
}

impl FleetFile {
    /// Reads and parses the fleet file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FleetFileError::Io`] or [`FleetFileError::Parse`].
    pub fn load(path: &Utf8Path) -> Result<Self, FleetFileError> {
        let contents = read_file(path)?;
        Self::parse(path, &contents)
    }

    /// Parses fleet file contents; `path` is only used in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`FleetFileError::Parse`] when the TOML does not match the
    /// fleet schema.
    pub fn parse(path: &Utf8Path, contents: &str) -> Result<Self, FleetFileError> {
        toml::from_str(contents).map_err(|err| FleetFileError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Checks that the file describes at least one listable pair.
    ///
    /// # Errors
    ///
    /// Returns [`FleetFileError::Invalid`] naming the first problem found.
    pub fn validate(&self) -> Result<(), FleetFileError> {
        if self.accounts.is_empty() {
            return Err(FleetFileError::Invalid(String::from(
                "at least one [[accounts]] entry is required",
            )));
        }
        for account in &self.accounts {
            if account.profile.trim().is_empty() {
                return Err(FleetFileError::Invalid(String::from(
                    "every [[accounts]] entry needs a profile",
                )));
            }
            if account.regions.is_empty() && self.default_regions.is_empty() {
                return Err(FleetFileError::Invalid(format!(
                    "account {} has no regions and default_regions is empty",
                    account.profile
                )));
            }
        }
        Ok(())
    }

    /// Every (account, region) pair, in file order.
    #[must_use]
    pub fn targets(&self) -> Vec<FetchTarget> {
        self.accounts
            .iter()
            .flat_map(|account| {
                let regions = if account.regions.is_empty() {
                    &self.default_regions
                } else {
                    &account.regions
                };
                regions.iter().map(move |region| FetchTarget {
                    account: account.profile.clone(),
                    region: region.clone(),
                    env: account.env.clone(),
                })
            })
            .collect()
    }

    /// Private keys to offer: explicit entries first, then `key_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`FleetFileError::KeyDir`] when `key_dir` cannot be listed.
    pub fn key_paths(&self) -> Result<Vec<Utf8PathBuf>, FleetFileError> {
        let mut keys: Vec<Utf8PathBuf> = self
            .keys
            .iter()
            .map(|key| Utf8PathBuf::from(expand_tilde(key)))
            .filter(|key| !self.is_blacklisted(key))
            .collect();
        if let Some(dir) = &self.key_dir {
            let expanded = Utf8PathBuf::from(expand_tilde(dir));
            for key in discover_keys(&expanded, &self.key_blacklist)? {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    fn is_blacklisted(&self, key: &Utf8Path) -> bool {
        key.file_name()
            .is_some_and(|name| self.key_blacklist.iter().any(|entry| entry == name))
    }

    /// Candidates in trial order: each user with each key.
    #[must_use]
    pub fn candidates(&self, keys: &[Utf8PathBuf]) -> Vec<Candidate> {
        self.users
            .iter()
            .flat_map(|user| keys.iter().map(move |key| Candidate::with_key(user.as_str(), key.clone())))
            .collect()
    }

    /// Assembles the per-cycle settings.
    ///
    /// # Errors
    ///
    /// Returns [`FleetFileError`] when validation or key discovery fails.
    pub fn cycle_settings(&self, config: &InventoryConfig) -> Result<CycleSettings, FleetFileError> {
        self.validate()?;
        let keys = self.key_paths()?;
        Ok(CycleSettings {
            targets: self.targets(),
            candidates: self.candidates(&keys),
            tag_filter: TagFilter::new(
                self.required_tags.iter().cloned(),
                self.ignored_tags.iter().cloned(),
            ),
            os_map: self.os_map.clone(),
            fetch_workers: config.fetch_workers,
            probe_workers: config.probe_workers,
        })
    }
}

fn read_file(path: &Utf8Path) -> Result<String, FleetFileError> {
    let io_err = |target: &Utf8Path, err: &io::Error| FleetFileError::Io {
        path: target.to_path_buf(),
        message: err.to_string(),
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| FleetFileError::Io {
        path: path.to_path_buf(),
        message: String::from("fleet file path is missing a filename"),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_err(parent, &err))?;
    dir.read_to_string(file_name)
        .map_err(|err| io_err(path, &err))
}
