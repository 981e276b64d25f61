//! LXD API data models

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Standard LXD response envelope.
///
/// Every endpoint answers with `type` set to `sync`, `async` or `error`;
/// `metadata` carries the payload for sync responses and the operation
/// description for async ones.
#[derive(Debug, Clone, Deserialize)]
pub struct LxdResponse<T> {
    #[serde(rename = "type")]
    pub response_type: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<u16>,
    pub metadata: Option<T>,
}

/// An LXD instance (container or VM)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    /// "Running", "Stopped", "Frozen", ...
    pub status: String,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Instance {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }
}

/// Runtime state of an instance (`/1.0/instances/{name}/state`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceState {
    pub status: String,
    #[serde(default)]
    pub network: Option<HashMap<String, NetworkInterface>>,
}

impl InstanceState {
    /// First global IPv4 address on a non-loopback interface.
    #[must_use]
    pub fn ipv4_address(&self) -> Option<String> {
        let network = self.network.as_ref()?;
        let mut names: Vec<&String> = network.keys().filter(|n| n.as_str() != "lo").collect();
        names.sort();
        names.into_iter().find_map(|name| {
            network[name]
                .addresses
                .iter()
                .find(|a| a.family == "inet" && a.scope == "global")
                .map(|a| a.address.clone())
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInterface {
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub family: String,
    pub address: String,
    #[serde(default)]
    pub scope: String,
}

/// Body of `POST /1.0/instances`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub source: InstanceSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    /// Start the instance once created
    pub start: bool,
}

impl CreateInstanceRequest {
    /// Container created from an image alias and started immediately.
    #[must_use]
    pub fn from_image(name: &str, alias: &str) -> Self {
        Self {
            name: name.to_string(),
            source: InstanceSource {
                source_type: "image".to_string(),
                alias: alias.to_string(),
            },
            profiles: Vec::new(),
            config: BTreeMap::new(),
            start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub alias: String,
}

/// Background operation as returned by `/1.0/operations/{id}/wait`
#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub err: String,
}
