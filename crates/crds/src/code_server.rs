//! CodeServer CRD
//!
//! A browser-based development environment. The controller turns each
//! `CodeServer` into a workload (code-server plus a liveness exporter sidecar),
//! a Service, an optional Ingress, or an instance on an LXD backend.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer placed on every managed `CodeServer`.
pub const CODE_SERVER_FINALIZER: &str = "codeserver.dev/cleanup";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "codeserver.dev",
    version = "v1alpha1",
    kind = "CodeServer",
    namespaced,
    status = "CodeServerStatus",
    shortname = "cs",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Failures","type":"integer","jsonPath":".status.probeFailureCount"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CodeServerSpec {
    /// Container image running the code-server process
    pub image: String,

    /// Resource limits for the code-server container
    #[serde(default)]
    pub resources: ResourceLimits,

    /// Request a public ingress route (only honoured when the operator enables user ingress)
    #[serde(default)]
    pub public_ingress: bool,

    /// Overrides the operator's default exporter sidecar image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter_image: Option<String>,

    /// Where the instance runs
    #[serde(default)]
    pub runtime: Runtime,

    /// LXD settings, required when `runtime` is `Lxd`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lxd: Option<LxdInstanceSpec>,

    /// Extra environment for the code-server container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU limit as a Kubernetes quantity, e.g. "2" or "500m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory limit as a Kubernetes quantity, e.g. "4Gi"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Execution backend for an instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum Runtime {
    /// Deployment scheduled by the cluster
    #[default]
    Kubernetes,

    /// Container on an external LXD host
    Lxd,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LxdInstanceSpec {
    /// Image alias on the LXD server, e.g. "ubuntu/22.04"
    pub image_alias: String,

    /// LXD profiles applied to the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodeServerStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: Phase,

    /// Generation of the spec last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Consecutive failed liveness probes
    #[serde(default)]
    pub probe_failure_count: u32,

    /// Time of the probe that produced `probe_failure_count`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,

    /// URL probed by the liveness watcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_endpoint: Option<String>,

    /// Public URL, when an ingress route exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Consecutive failed reconcile attempts
    #[serde(default)]
    pub reconcile_failures: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Coarse lifecycle state of a `CodeServer`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
    #[default]
    Pending,
    Provisioning,
    Active,
    Degraded,
    Inactive,
    Failed,
    Terminating,
}

impl Phase {
    /// Phases in which the liveness watcher probes the instance.
    #[must_use]
    pub fn is_probed(self) -> bool {
        matches!(self, Phase::Active | Phase::Degraded | Phase::Inactive)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Provisioning => "Provisioning",
            Phase::Active => "Active",
            Phase::Degraded => "Degraded",
            Phase::Inactive => "Inactive",
            Phase::Failed => "Failed",
            Phase::Terminating => "Terminating",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status condition, in the shape used by core Kubernetes objects.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition types written by the controller.
pub mod condition_types {
    /// Workload is serving
    pub const READY: &str = "Ready";
    /// Liveness probes are passing
    pub const PROBE_HEALTHY: &str = "ProbeHealthy";
    /// Spec passed validation
    pub const SPEC_VALID: &str = "SpecValid";
    /// Reconciliation keeps failing after repeated retries
    pub const RECONCILE_ERROR: &str = "ReconcileError";
}
