//! Canonical instance record tracked by the inventory.
//!
//! An [`Instance`] is the provider-neutral view of one compute resource. The
//! translator builds it from a raw provider descriptor, the store persists it,
//! and the reconciler folds discovered SSH credentials back into it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle state written by the store once an instance disappears from
/// the provider listing. Rows in this state are never mutated again.
pub const TERMINATED: &str = "terminated";

/// Provider-reported state for instances that are eligible for probing.
pub const RUNNING: &str = "running";

/// SSH port assumed when no port has been discovered for an instance.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// One observed compute resource.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Instance {
    /// Provider-assigned identifier, unique and immutable.
    pub id: String,
    /// Cloud account (profile) the instance was observed in.
    pub account: String,
    /// Region the instance was observed in.
    pub region: String,
    /// Provider family, for example `aws`.
    pub cloud_provider: String,
    /// Image identifier the instance booted from.
    pub ami: String,
    /// Value of the `Name` tag, empty when untagged.
    pub name: String,
    /// Provider key pair name, empty when none was attached.
    pub keypair_name: String,
    /// Launch timestamp reported by the provider.
    pub launch_time: DateTime<Utc>,
    /// Instance size or type, for example `t3.micro`.
    pub size: String,
    /// Subnet identifier, empty when absent.
    pub subnet: String,
    /// VPC identifier, empty when absent.
    pub vpc: String,
    /// Provider-reported lifecycle string (`running`, `stopped`, ...).
    pub state: String,
    /// Operating system family derived from platform details.
    pub os: String,
    /// Private IPv4 address, empty when absent.
    pub private_ip: String,
    /// Public IPv4 address, empty when absent.
    pub public_ip: String,
    /// Private key path that opened a session, empty until discovered.
    pub ssh_key: String,
    /// SSH port that accepted a session, if discovered.
    pub ssh_port: Option<u16>,
    /// Login user that opened a session, empty until discovered.
    pub user: String,
    /// Logical environment tag taken from the account configuration.
    pub env: String,
    /// Free-form operator notes.
    pub notes: String,
    /// Operator override excluding the instance from probing.
    pub skip: bool,
    /// Provider tags, owned exclusively by this instance.
    pub tags: BTreeMap<String, String>,
    /// Timestamp of the most recent cycle that observed the instance.
    pub last_seen: Option<DateTime<Utc>>,
}

impl Instance {
    /// Returns `true` once the instance has reached the terminal state.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state == TERMINATED
    }

    /// Returns the address used for SSH, preferring the public IP.
    ///
    /// Returns `None` when the provider reported neither address, which
    /// usually means the instance is shutting down.
    #[must_use]
    pub fn connection_address(&self) -> Option<&str> {
        [self.public_ip.as_str(), self.private_ip.as_str()]
            .into_iter()
            .find(|addr| !addr.is_empty())
    }

    /// Returns the discovered SSH port or the protocol default.
    #[must_use]
    pub fn ssh_port_or_default(&self) -> u16 {
        self.ssh_port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// Copies operator- and discovery-owned fields from the stored record.
    ///
    /// A fresh snapshot never carries these fields, so without this step an
    /// update would blank credentials found by an earlier cycle.
    pub fn carry_forward(&mut self, stored: &Self) {
        if self.user.is_empty() {
            self.user.clone_from(&stored.user);
        }
        if self.ssh_key.is_empty() {
            self.ssh_key.clone_from(&stored.ssh_key);
        }
        if self.ssh_port.is_none() {
            self.ssh_port = stored.ssh_port;
        }
        if self.notes.is_empty() {
            self.notes.clone_from(&stored.notes);
        }
        self.skip = self.skip || stored.skip;
    }
}
