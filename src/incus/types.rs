//! Incus API payloads.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard response envelope (`sync`, `async` or `error`).
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub error_code: u16,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Closed set of container states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Frozen,
    Unknown,
}

impl ContainerStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "Running" => ContainerStatus::Running,
            "Stopped" => ContainerStatus::Stopped,
            "Frozen" => ContainerStatus::Frozen,
            _ => ContainerStatus::Unknown,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub type Device = BTreeMap<String, String>;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
    #[serde(default)]
    pub expanded_devices: BTreeMap<String, Device>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub description: String,
    /// Only present with `recursion=2`.
    #[serde(default, skip_serializing)]
    pub state: Option<InstanceState>,
}

impl Instance {
    pub fn status(&self) -> ContainerStatus {
        ContainerStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct InstanceState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub network: Option<BTreeMap<String, Network>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Network {
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkAddress {
    pub family: String,
    pub address: String,
    #[serde(default)]
    pub scope: String,
}

impl InstanceState {
    /// First globally scoped address of `family` ("inet" or "inet6"),
    /// skipping the loopback interface.
    pub fn first_global(&self, family: &str) -> Option<String> {
        self.network
            .as_ref()?
            .iter()
            .filter(|(iface, _)| iface.as_str() != "lo")
            .flat_map(|(_, net)| net.addresses.iter())
            .find(|a| a.family == family && a.scope == "global")
            .map(|a| a.address.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub name: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub stateful: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageAliasRef {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub fingerprint: String,
    #[serde(default)]
    pub aliases: Vec<ImageAliasRef>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
pub struct UsedTotal {
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
pub struct StoragePoolResources {
    #[serde(default)]
    pub space: UsedTotal,
    #[serde(default)]
    pub inodes: UsedTotal,
}

/// Where a new container's image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Local alias.
    Alias(String),
    /// Local image by fingerprint.
    Fingerprint(String),
    /// Simplestreams image, e.g. `ubuntu/22.04/cloud`.
    Remote { server: String, alias: String },
    /// Simplestreams image pinned to a fingerprint.
    Pinned { server: String, fingerprint: String },
}

pub const DEFAULT_IMAGE_SERVER: &str = "https://images.linuxcontainers.org";

impl ImageSource {
    /// `image_ref` containing a `/` is a remote simplestreams alias.
    pub fn from_ref(image_ref: &str) -> Self {
        if image_ref.contains('/') {
            ImageSource::Remote {
                server: DEFAULT_IMAGE_SERVER.to_string(),
                alias: image_ref.to_string(),
            }
        } else {
            ImageSource::Alias(image_ref.to_string())
        }
    }

    /// Name shown to users and recorded as the base image.
    pub fn display_ref(&self) -> &str {
        match self {
            ImageSource::Alias(a) | ImageSource::Remote { alias: a, .. } => a,
            ImageSource::Fingerprint(f) | ImageSource::Pinned { fingerprint: f, .. } => f,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ImageSource::Alias(alias) => serde_json::json!({"type": "image", "alias": alias}),
            ImageSource::Fingerprint(fp) => {
                serde_json::json!({"type": "image", "fingerprint": fp})
            }
            ImageSource::Remote { server, alias } => serde_json::json!({
                "type": "image",
                "mode": "pull",
                "protocol": "simplestreams",
                "server": server,
                "alias": alias,
            }),
            ImageSource::Pinned {
                server,
                fingerprint,
            } => serde_json::json!({
                "type": "image",
                "mode": "pull",
                "protocol": "simplestreams",
                "server": server,
                "fingerprint": fingerprint,
            }),
        }
    }
}

/// Conditions understood by `wait_for_condition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Running,
    Stopped,
    HasIpv4,
    HasIpv6,
    HasIp,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Condition::Running => "running",
            Condition::Stopped => "stopped",
            Condition::HasIpv4 => "IPv4 address",
            Condition::HasIpv6 => "IPv6 address",
            Condition::HasIp => "IP address",
        };
        f.write_str(s)
    }
}

/// Captured result of a non-interactive exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_classification() {
        assert_eq!(
            ImageSource::from_ref("coop-agent-base"),
            ImageSource::Alias("coop-agent-base".into())
        );
        let remote = ImageSource::from_ref("ubuntu/22.04/cloud").to_json();
        assert_eq!(remote["server"], DEFAULT_IMAGE_SERVER);
        assert_eq!(remote["protocol"], "simplestreams");
    }

    #[test]
    fn global_ipv4_skips_loopback_and_link_local() {
        let state: InstanceState = serde_json::from_value(serde_json::json!({
            "status": "Running",
            "network": {
                "eth0": {"addresses": [
                    {"family": "inet6", "address": "fe80::1", "scope": "link"},
                    {"family": "inet", "address": "10.10.0.5", "scope": "global"},
                    {"family": "inet6", "address": "fd42::5", "scope": "global"}
                ]},
                "lo": {"addresses": [
                    {"family": "inet", "address": "127.0.0.1", "scope": "local"}
                ]}
            }
        }))
        .unwrap();
        assert_eq!(state.first_global("inet").as_deref(), Some("10.10.0.5"));
        assert_eq!(state.first_global("inet6").as_deref(), Some("fd42::5"));
    }

    #[test]
    fn no_network_means_no_address() {
        assert_eq!(InstanceState::default().first_global("inet"), None);
    }

    #[test]
    fn status_parsing() {
        assert_eq!(ContainerStatus::parse("Frozen"), ContainerStatus::Frozen);
        assert_eq!(ContainerStatus::parse("Error"), ContainerStatus::Unknown);
    }
}
