//! Controller-specific error types.
//!
//! Errors are split into transient ones (retried with backoff) and terminal
//! ones (recorded on the resource status and left alone until the spec changes).

use crate::store::StoreError;
use kube::Error as KubeError;
use lxd_client::LxdError;
use thiserror::Error;

/// Errors that can occur in the CodeServer Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error outside the cluster store (client setup, watches)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster store read or write failed
    #[error("Cluster store error: {0}")]
    Store(#[from] StoreError),

    /// LXD backend error
    #[error("LXD error: {0}")]
    Lxd(#[from] LxdError),

    /// Invalid operator configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The resource spec cannot be satisfied
    #[error("Invalid spec: {0}")]
    Validation(String),

    /// A referenced object (e.g. the TLS secret) does not exist yet
    #[error("Missing dependency: {0}")]
    DependencyMissing(String),

    /// Sub-resources still exist after cleanup
    #[error("Cleanup incomplete: {0}")]
    CleanupIncomplete(String),

    /// Liveness probe client could not be built
    #[error("Probe client error: {0}")]
    Probe(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether retrying the same reconcile can succeed without a spec change.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Store(e) => e.is_transient(),
            ControllerError::Lxd(e) => e.is_transient(),
            ControllerError::Kube(_)
            | ControllerError::DependencyMissing(_)
            | ControllerError::CleanupIncomplete(_)
            | ControllerError::Watch(_) => true,
            ControllerError::InvalidConfig(_)
            | ControllerError::Validation(_)
            | ControllerError::Probe(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ControllerError::Store(StoreError::Conflict("alice".into())).is_transient());
        assert!(ControllerError::DependencyMissing("secret".into()).is_transient());
        assert!(ControllerError::CleanupIncomplete("Deployment alice".into()).is_transient());
        assert!(!ControllerError::Validation("empty image".into()).is_transient());
        assert!(!ControllerError::Store(StoreError::Permanent("forbidden".into())).is_transient());
        assert!(
            ControllerError::Lxd(LxdError::Api {
                code: 503,
                message: "busy".into()
            })
            .is_transient()
        );
    }
}
