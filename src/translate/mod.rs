//! Descriptor translation from provider JSON into canonical instances.
//!
//! The raw types mirror the PascalCase output of `aws ec2
//! describe-instances`. [`translate`] is a pure function: optional fields
//! that the provider omits become empty strings, and a missing `Name` tag
//! yields an empty name rather than an error.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::Instance;

/// Provider family recorded on every translated instance.
pub const CLOUD_PROVIDER: &str = "aws";

/// Top-level document returned by `describe-instances`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeInstancesOutput {
    /// Launch reservations, each holding one or more instances.
    #[serde(default)]
    pub reservations: Vec<Reservation>,
}

impl DescribeInstancesOutput {
    /// Flattens every reservation into a single descriptor list.
    #[must_use]
    pub fn into_instances(self) -> Vec<RawInstance> {
        self.reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .collect()
    }
}

/// One launch reservation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Reservation {
    /// Instances launched together.
    #[serde(default)]
    pub instances: Vec<RawInstance>,
}

/// Provider-specific instance descriptor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RawInstance {
    /// Provider identifier (mandatory).
    pub instance_id: String,
    /// Boot image identifier (mandatory).
    pub image_id: String,
    /// Launch timestamp (mandatory).
    pub launch_time: DateTime<Utc>,
    /// Instance type, for example `t3.micro`.
    #[serde(default)]
    pub instance_type: Option<String>,
    /// Attached key pair name.
    #[serde(default)]
    pub key_name: Option<String>,
    /// Subnet identifier.
    #[serde(default)]
    pub subnet_id: Option<String>,
    /// VPC identifier.
    #[serde(default)]
    pub vpc_id: Option<String>,
    /// Private IPv4 address.
    #[serde(default)]
    pub private_ip_address: Option<String>,
    /// Public IPv4 address.
    #[serde(default)]
    pub public_ip_address: Option<String>,
    /// Platform description, for example `Linux/UNIX`.
    #[serde(default)]
    pub platform_details: Option<String>,
    /// Lifecycle state.
    #[serde(default)]
    pub state: Option<RawState>,
    /// Provider tags.
    #[serde(default)]
    pub tags: Option<Vec<RawTag>>,
}

/// Lifecycle state wrapper used by the provider.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RawState {
    /// State name such as `running` or `stopped`.
    pub name: String,
}

/// Key/value tag pair.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RawTag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// Where a descriptor was observed. Supplied by the fetch target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Placement {
    /// Account (profile) name.
    pub account: String,
    /// Region name.
    pub region: String,
    /// Logical environment of the account.
    pub env: String,
}

/// Tag-based admission and scrubbing rules applied after translation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TagFilter {
    required: BTreeSet<String>,
    ignored: BTreeSet<String>,
}

impl TagFilter {
    /// Builds a filter from required and ignored tag keys.
    #[must_use]
    pub fn new<R, I>(required: R, ignored: I) -> Self
    where
        R: IntoIterator<Item = String>,
        I: IntoIterator<Item = String>,
    {
        Self {
            required: required.into_iter().collect(),
            ignored: ignored.into_iter().collect(),
        }
    }

    /// Returns `true` when the instance carries every required tag key.
    #[must_use]
    pub fn admits(&self, instance: &Instance) -> bool {
        self.required
            .iter()
            .all(|key| instance.tags.contains_key(key))
    }

    /// Removes ignored tag keys from the instance.
    pub fn scrub(&self, instance: &mut Instance) {
        instance.tags.retain(|key, _| !self.ignored.contains(key));
    }
}

/// Maps provider platform descriptions onto short OS names.
pub type OsMap = BTreeMap<String, String>;

/// Translates one raw descriptor into a canonical [`Instance`].
///
/// Connectivity and bookkeeping fields (`user`, `ssh_key`, `ssh_port`,
/// `notes`, `skip`, `last_seen`) start empty; the reconciler and the store
/// own them.
#[must_use]
pub fn translate(raw: &RawInstance, placement: &Placement, os_map: &OsMap) -> Instance {
    let tags: BTreeMap<String, String> = raw
        .tags
        .iter()
        .flatten()
        .map(|tag| (tag.key.clone(), tag.value.clone()))
        .collect();
    let platform = raw.platform_details.clone().unwrap_or_default();
    let os = os_map.get(&platform).cloned().unwrap_or(platform);

    Instance {
        id: raw.instance_id.clone(),
        account: placement.account.clone(),
        region: placement.region.clone(),
        cloud_provider: String::from(CLOUD_PROVIDER),
        ami: raw.image_id.clone(),
        name: name_tag(raw).unwrap_or_default(),
        keypair_name: raw.key_name.clone().unwrap_or_default(),
        launch_time: raw.launch_time,
        size: raw.instance_type.clone().unwrap_or_default(),
        subnet: raw.subnet_id.clone().unwrap_or_default(),
        vpc: raw.vpc_id.clone().unwrap_or_default(),
        state: raw
            .state
            .as_ref()
            .map(|state| state.name.clone())
            .unwrap_or_default(),
        os,
        private_ip: raw.private_ip_address.clone().unwrap_or_default(),
        public_ip: raw.public_ip_address.clone().unwrap_or_default(),
        ssh_key: String::new(),
        ssh_port: None,
        user: String::new(),
        env: placement.env.clone(),
        notes: String::new(),
        skip: false,
        tags,
        last_seen: None,
    }
}

fn name_tag(raw: &RawInstance) -> Option<String> {
    raw.tags
        .iter()
        .flatten()
        .find(|tag| tag.key.eq_ignore_ascii_case("name"))
        .map(|tag| tag.value.clone())
}
