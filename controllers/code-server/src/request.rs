//! Reconcile requests and the bounded channel that carries watcher signals.
//!
//! The channel holds at most [`REQUEST_CHANNEL_CAPACITY`] requests. Producers
//! never wait on it: a full channel drops the request, and the watcher
//! re-derives the same signal on its next tick.

use crate::workqueue::Coalesce;
use chrono::{DateTime, Utc};
use crds::CodeServer;
use kube::ResourceExt;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Namespace + name of a `CodeServer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a fetched resource; `None` for objects without a namespace.
    pub fn from_resource(resource: &CodeServer) -> Option<Self> {
        Some(Self::new(resource.namespace()?, resource.name_any()))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Why a reconcile was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileReason {
    SpecChanged,
    ProbeFailureThresholdReached,
    ProbeRecovered,
    ResourceDeleted,
    /// An owned Deployment changed
    SubResourceChanged,
    /// Follow-up scheduled by a worker (backoff or provisioning poll)
    Retry,
}

impl fmt::Display for ReconcileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileReason::SpecChanged => "SpecChanged",
            ReconcileReason::ProbeFailureThresholdReached => "ProbeFailureThresholdReached",
            ReconcileReason::ProbeRecovered => "ProbeRecovered",
            ReconcileReason::ResourceDeleted => "ResourceDeleted",
            ReconcileReason::SubResourceChanged => "SubResourceChanged",
            ReconcileReason::Retry => "Retry",
        };
        f.write_str(s)
    }
}

/// Watcher observation carried to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSignal {
    pub failure_count: u32,
    pub probed_at: DateTime<Utc>,
}

/// One unit of work for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub key: ResourceKey,
    pub reason: ReconcileReason,
    /// Set for probe-related reasons; otherwise the stored count applies
    pub probe: Option<ProbeSignal>,
}

impl ReconcileRequest {
    pub fn new(key: ResourceKey, reason: ReconcileReason) -> Self {
        Self {
            key,
            reason,
            probe: None,
        }
    }

    pub fn threshold_reached(key: ResourceKey, failure_count: u32, probed_at: DateTime<Utc>) -> Self {
        Self {
            key,
            reason: ReconcileReason::ProbeFailureThresholdReached,
            probe: Some(ProbeSignal {
                failure_count,
                probed_at,
            }),
        }
    }

    pub fn recovered(key: ResourceKey, probed_at: DateTime<Utc>) -> Self {
        Self {
            key,
            reason: ReconcileReason::ProbeRecovered,
            probe: Some(ProbeSignal {
                failure_count: 0,
                probed_at,
            }),
        }
    }

    /// Follow-up for the same key that still carries the probe signal.
    #[must_use]
    pub fn retry(&self) -> Self {
        Self {
            key: self.key.clone(),
            reason: ReconcileReason::Retry,
            probe: self.probe,
        }
    }
}

impl Coalesce for ReconcileRequest {
    /// The newest reason wins; a probe signal survives until a newer one replaces it.
    fn coalesce(&mut self, newer: Self) {
        self.reason = newer.reason;
        if newer.probe.is_some() {
            self.probe = newer.probe;
        }
    }
}

/// Result of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Delivered,
    /// Channel full; the request was discarded
    Dropped,
    /// Receiver gone (shutting down)
    Closed,
}

impl Offer {
    #[must_use]
    pub fn is_delivered(self) -> bool {
        self == Offer::Delivered
    }
}

/// Producer half of the request channel.
#[derive(Debug, Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<ReconcileRequest>,
}

impl RequestSender {
    /// Send without waiting.
    pub fn offer(&self, request: ReconcileRequest) -> Offer {
        match self.tx.try_send(request) {
            Ok(()) => Offer::Delivered,
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!(
                    "Request channel full, dropping {} for {} (next probe pass will re-emit)",
                    request.reason, request.key
                );
                Offer::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                debug!("Request channel closed, discarding {} for {}", request.reason, request.key);
                Offer::Closed
            }
        }
    }
}

/// Create the bounded request channel.
pub fn request_channel() -> (RequestSender, mpsc::Receiver<ReconcileRequest>) {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
    (RequestSender { tx }, rx)
}
