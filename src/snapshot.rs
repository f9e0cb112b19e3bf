//! The replayable container configuration snapshot.
//!
//! The daemon's container configuration is sprawling and loosely typed.
//! Instead of passing it through as an opaque blob, everything we preserve
//! across a destroy/recreate boundary is enumerated here as a closed record.
//! Replaying a [`ConfigDescriptor`] with only the image substituted must
//! reproduce an operationally equivalent container; any inspected field the
//! descriptor cannot represent makes the snapshot fail closed instead of
//! silently dropping configuration (see `runtime::docker`).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Everything needed to recreate a container identically except for the
/// image it runs. Created once per update attempt, discarded afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    /// The container's original name.
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Environment as a mapping; keys are unique by construction.
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    /// All labels, including the exclusion label itself: it must round-trip.
    pub labels: BTreeMap<String, String>,

    /// Exposed ports in `port/proto` form.
    pub exposed_ports: BTreeSet<String>,
    /// Host port bindings keyed by `port/proto`.
    pub port_bindings: BTreeMap<String, Vec<PortBindingSpec>>,

    /// Legacy `src:dst[:mode]` bind strings.
    pub binds: Vec<String>,
    /// Mount API mounts, order preserved.
    pub mounts: Vec<MountSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    /// Attached networks with their replayable endpoint settings.
    pub networks: BTreeMap<String, EndpointSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicySpec>,

    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nano_cpus: Option<i64>,

    pub extra_hosts: Vec<String>,
    pub dns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBindingSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Absent for anonymous volumes and tmpfs mounts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
    pub kind: MountKind,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyKind {
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicySpec {
    pub kind: RestartPolicyKind,
    pub maximum_retry_count: i64,
}

/// Convert the daemon's `KEY=value` environment list into a unique-key map.
/// Values may themselves contain `=`; only the first one splits.
pub fn env_to_map(env: &[String]) -> BTreeMap<String, String> {
    env.iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Back to the `KEY=value` list form the create API expects.
pub fn map_to_env(map: &BTreeMap<String, String>) -> Vec<String> {
    map.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}
