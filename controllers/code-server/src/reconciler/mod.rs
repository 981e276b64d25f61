//! Reconciliation logic for CodeServer resources.
//!
//! - `validation`: spec checks that are terminal for a generation
//! - `subresource`: ensure/delete for Secret, Deployment, Service, Ingress
//! - `lxd`: the external LXD runtime
//! - `finalizer`: finalizer bookkeeping and cleanup
//! - `status`: phase rule and status computation

pub mod finalizer;
pub mod lxd;
pub mod status;
pub mod subresource;
pub mod validation;

use crate::config::Options;
use crate::error::ControllerError;
use crate::request::{ReconcileRequest, ResourceKey};
use crate::resources::{
    deployment_ready, desired_state, ingress_url, service_probe_endpoint, SubResource, SubResourceKind,
};
use crate::store::ClusterStore;
use chrono::Utc;
use crds::{CodeServer, CodeServerStatus, Phase, Runtime};
use lxd_client::LxdClientTrait;
use status::Observation;
use std::sync::Arc;
use std::time::Duration;
use subresource::Action;
use tracing::{debug, info, warn};

/// What the worker should do after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Wait for the next event
    Done,
    /// Reconcile again after the delay even without an event
    RequeueAfter(Duration),
}

/// Converges one `CodeServer` at a time; shared by all workers.
pub struct Reconciler {
    pub(crate) store: Arc<dyn ClusterStore>,
    /// `None` when the LXD backend is disabled
    pub(crate) lxd: Option<Arc<dyn LxdClientTrait>>,
    pub(crate) options: Arc<Options>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        store: Arc<dyn ClusterStore>,
        lxd: Option<Arc<dyn LxdClientTrait>>,
        options: Arc<Options>,
    ) -> Self {
        Self { store, lxd, options }
    }

    /// Reconciles one key. Idempotent.
    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconcileOutcome, ControllerError> {
        let key = &request.key;
        debug!("Reconciling CodeServer {} ({})", key, request.reason);

        let Some(cs) = self.store.get_code_server(key).await? else {
            debug!("CodeServer {} no longer exists, removing leftovers", key);
            let leftovers = self.cleanup(key).await?;
            if !leftovers.is_empty() {
                return Err(ControllerError::CleanupIncomplete(leftovers.join(", ")));
            }
            return Ok(ReconcileOutcome::Done);
        };

        if cs.metadata.deletion_timestamp.is_some() {
            self.finalize(key, &cs).await?;
            return Ok(ReconcileOutcome::Done);
        }

        let version = self.ensure_finalizer(key, &cs).await?;
        let current = cs.status.clone().unwrap_or_default();
        let generation = cs.metadata.generation;

        if current.phase == Phase::Failed && current.observed_generation == generation {
            debug!("CodeServer {} generation {:?} already failed validation", key, generation);
            return Ok(ReconcileOutcome::Done);
        }

        if let Err(e) = validation::validate(&cs, &self.options, self.lxd.is_some()) {
            warn!("CodeServer {} is invalid: {}", key, e);
            let failed = status::failed_status(&current, generation, &e.to_string(), Utc::now());
            self.write_status(key, version.as_deref(), &current, &failed).await?;
            return Ok(ReconcileOutcome::Done);
        }

        let observation = match cs.spec.runtime {
            Runtime::Kubernetes => self.converge_kubernetes(key, &cs).await?,
            Runtime::Lxd => {
                self.remove_cluster_workload(key, &cs).await?;
                self.converge_lxd(key, &cs).await?
            }
        };

        let next = status::next_status(
            &current,
            generation,
            &observation,
            request.probe,
            self.options.max_probe_retry,
            Utc::now(),
        );
        if next.phase != current.phase {
            info!(
                "CodeServer {} phase {} -> {} ({})",
                key, current.phase, next.phase, request.reason
            );
        }
        self.write_status(key, version.as_deref(), &current, &next).await?;

        Ok(match next.phase {
            Phase::Provisioning => ReconcileOutcome::RequeueAfter(self.options.probe_interval),
            _ => ReconcileOutcome::Done,
        })
    }

    /// Ensure every sub-resource kind in order and report workload readiness.
    async fn converge_kubernetes(&self, key: &ResourceKey, cs: &CodeServer) -> Result<Observation, ControllerError> {
        let mut observation = Observation {
            probe_endpoint: Some(service_probe_endpoint(key, &self.options)),
            ..Default::default()
        };

        for kind in SubResourceKind::ALL {
            let desired = desired_state(kind, cs, &self.options);
            let ensured = subresource::ensure(self.store.as_ref(), key, kind, desired, &self.options).await?;
            match (kind, ensured.action, ensured.current) {
                (SubResourceKind::Deployment, Action::Unchanged, Some(SubResource::Deployment(deployment))) => {
                    observation.workload_ready = deployment_ready(&deployment);
                }
                (SubResourceKind::Ingress, Action::Created | Action::Updated | Action::Unchanged, _) => {
                    observation.url = Some(ingress_url(cs, &self.options));
                }
                _ => {}
            }
        }

        // An instance left behind by a previous `runtime: Lxd`
        if let Some(lxd) = self.lxd.as_deref() {
            lxd::remove_instance(lxd, key).await?;
        }

        Ok(observation)
    }

    /// Delete what a previous `runtime: Kubernetes` left behind.
    async fn remove_cluster_workload(&self, key: &ResourceKey, cs: &CodeServer) -> Result<(), ControllerError> {
        for kind in SubResourceKind::ALL {
            let desired = desired_state(kind, cs, &self.options);
            let ensured = subresource::ensure(self.store.as_ref(), key, kind, desired, &self.options).await?;
            if ensured.action == Action::Deleted {
                info!("Removed {} of {} after switching to LXD", kind, key);
            }
        }
        Ok(())
    }

    /// Write `next` unless it equals `current`.
    async fn write_status(
        &self,
        key: &ResourceKey,
        version: Option<&str>,
        current: &CodeServerStatus,
        next: &CodeServerStatus,
    ) -> Result<(), ControllerError> {
        if current == next {
            debug!("CodeServer {} status unchanged", key);
            return Ok(());
        }
        self.store.write_status(key, version, next).await?;
        Ok(())
    }

    /// Record that automatic retries for `key` ran out.
    ///
    /// The key stays eligible for reconciles triggered by new events.
    pub async fn record_exhaustion(
        &self,
        key: &ResourceKey,
        attempts: u32,
        error: &ControllerError,
    ) -> Result<(), ControllerError> {
        let Some(cs) = self.store.get_code_server(key).await? else {
            return Ok(());
        };
        let current = cs.status.clone().unwrap_or_default();
        let next = status::exhausted_status(&current, attempts, &error.to_string(), Utc::now());
        self.store
            .write_status(key, cs.metadata.resource_version.as_deref(), &next)
            .await?;
        warn!(
            "CodeServer {} failed {} reconciles in a row, giving up until the next change: {}",
            key, attempts, error
        );
        Ok(())
    }
}
