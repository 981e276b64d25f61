//! Cluster change notifications.
//!
//! Watches `CodeServer`s and the Deployments they own and turns events into
//! work-queue entries. Status writes bump the resource version but not the
//! generation, so a fingerprint of (generation, deleting) keeps the
//! controller's own status updates from re-triggering reconciles.

use crate::error::ControllerError;
use crate::request::{ReconcileReason, ReconcileRequest, ResourceKey};
use crate::resources::{owning_code_server, MANAGED_BY};
use crate::shutdown::Shutdown;
use crate::worker::RequestQueue;
use crds::CodeServer;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use kube_runtime::{watcher, WatchStreamExt};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    generation: Option<i64>,
    deleting: bool,
}

impl Fingerprint {
    fn of(cs: &CodeServer) -> Self {
        Self {
            generation: cs.metadata.generation,
            deleting: cs.metadata.deletion_timestamp.is_some(),
        }
    }
}

/// Passes an event only when the spec or the deletion state changed.
#[derive(Debug, Default)]
pub struct ChangeFilter {
    seen: HashMap<ResourceKey, Fingerprint>,
}

impl ChangeFilter {
    /// Whether `cs` differs from the last admitted version. First sightings always pass.
    pub fn admit(&mut self, key: &ResourceKey, cs: &CodeServer) -> bool {
        let fingerprint = Fingerprint::of(cs);
        match self.seen.insert(key.clone(), fingerprint) {
            Some(previous) => previous != fingerprint,
            None => true,
        }
    }

    pub fn forget(&mut self, key: &ResourceKey) {
        self.seen.remove(key);
    }
}

/// Map a `CodeServer` event to a request.
pub(crate) fn code_server_request(
    filter: &mut ChangeFilter,
    event: watcher::Event<CodeServer>,
) -> Option<ReconcileRequest> {
    match event {
        watcher::Event::Apply(cs) | watcher::Event::InitApply(cs) => {
            let key = ResourceKey::from_resource(&cs)?;
            if !filter.admit(&key, &cs) {
                debug!("Ignoring status-only change to CodeServer {}", key);
                return None;
            }
            Some(ReconcileRequest::new(key, ReconcileReason::SpecChanged))
        }
        watcher::Event::Delete(cs) => {
            let key = ResourceKey::from_resource(&cs)?;
            filter.forget(&key);
            Some(ReconcileRequest::new(key, ReconcileReason::ResourceDeleted))
        }
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Map an owned Deployment event to a request for its `CodeServer`.
pub(crate) fn deployment_request(event: watcher::Event<Deployment>) -> Option<ReconcileRequest> {
    match event {
        watcher::Event::Apply(deployment)
        | watcher::Event::InitApply(deployment)
        | watcher::Event::Delete(deployment) => {
            let owner = owning_code_server(&deployment.metadata)?;
            let namespace = deployment.metadata.namespace?;
            Some(ReconcileRequest::new(
                ResourceKey::new(namespace, owner),
                ReconcileReason::SubResourceChanged,
            ))
        }
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Feeds cluster events into the work queue.
pub struct EventSource {
    client: Client,
    /// `None` watches all namespaces
    namespace: Option<String>,
    queue: Arc<RequestQueue>,
}

impl EventSource {
    pub fn new(client: Client, namespace: Option<String>, queue: Arc<RequestQueue>) -> Self {
        Self {
            client,
            namespace,
            queue,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn enqueue(&self, request: ReconcileRequest) {
        debug!("Event {} for {}", request.reason, request.key);
        self.queue.add(request.key.clone(), request);
    }

    /// Watch `CodeServer`s until `shutdown` fires.
    pub async fn watch_code_servers(&self, shutdown: Shutdown) -> Result<(), ControllerError> {
        let mut filter = ChangeFilter::default();
        self.watch::<CodeServer, _>(watcher::Config::default(), shutdown, |event| {
            code_server_request(&mut filter, event)
        })
        .await
    }

    /// Watch Deployments carrying the managed-by label until `shutdown` fires.
    pub async fn watch_deployments(&self, shutdown: Shutdown) -> Result<(), ControllerError> {
        let config = watcher::Config::default().labels(&format!("app.kubernetes.io/managed-by={}", MANAGED_BY));
        self.watch::<Deployment, _>(config, shutdown, deployment_request)
            .await
    }

    async fn watch<K, F>(
        &self,
        config: watcher::Config,
        mut shutdown: Shutdown,
        mut to_request: F,
    ) -> Result<(), ControllerError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + serde::de::DeserializeOwned + Send + 'static,
        K::DynamicType: Default,
        F: FnMut(watcher::Event<K>) -> Option<ReconcileRequest>,
    {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        info!("Starting {} event source", kind);

        let mut stream = Box::pin(watcher(self.api::<K>(), config).default_backoff());
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(watcher::Event::InitDone)) => info!("{} event source synced", kind),
                Some(Ok(event)) => {
                    if let Some(request) = to_request(event) {
                        self.enqueue(request);
                    }
                }
                Some(Err(e)) => warn!("{} watch error, retrying: {}", kind, e),
                None => return Err(ControllerError::Watch(format!("{} watch stream ended", kind))),
            }
        }
        info!("{} event source stopped", kind);
        Ok(())
    }
}
