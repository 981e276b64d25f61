//! Cluster access for the reconciler and the liveness watcher.
//!
//! `ClusterStore` is the narrow slice of the Kubernetes API the control loop
//! needs. `KubeStore` backs it with `kube::Api`; tests use the in-memory store
//! from `test_utils`.

use crate::request::ResourceKey;
use crate::resources::{SubResource, SubResourceKind};
use async_trait::async_trait;
use crds::{CodeServer, CodeServerStatus};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use thiserror::Error;
use tracing::debug;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "code-server-controller";

/// Cluster API failures, classified for retry decisions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency precondition failed
    #[error("conflict: {0}")]
    Conflict(String),

    /// Throttling, server errors, network failures
    #[error("transient API failure: {0}")]
    Transient(String),

    /// The request itself was rejected
    #[error("request rejected: {0}")]
    Permanent(String),
}

impl StoreError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Transient(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(response) => match response.code {
                404 => StoreError::NotFound(response.message),
                409 => StoreError::Conflict(response.message),
                429 | 500..=599 => StoreError::Transient(format!("{} ({})", response.message, response.code)),
                code => StoreError::Permanent(format!("{} ({})", response.message, code)),
            },
            kube::Error::SerdeError(e) => StoreError::Permanent(e.to_string()),
            other => StoreError::Transient(other.to_string()),
        }
    }
}

/// Cluster operations used by the control loop.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch one `CodeServer`; `None` when it does not exist.
    async fn get_code_server(&self, key: &ResourceKey) -> Result<Option<CodeServer>, StoreError>;

    /// List `CodeServer`s in the watched namespace(s).
    async fn list_code_servers(&self) -> Result<Vec<CodeServer>, StoreError>;

    /// Replace the status, guarded by `resource_version`.
    ///
    /// Fails with [`StoreError::Conflict`] when the object changed since it was read.
    /// Returns the new resource version.
    async fn write_status(
        &self,
        key: &ResourceKey,
        resource_version: Option<&str>,
        status: &CodeServerStatus,
    ) -> Result<Option<String>, StoreError>;

    /// Replace the finalizer list, guarded by `resource_version`. Returns the new resource version.
    async fn set_finalizers(
        &self,
        key: &ResourceKey,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<Option<String>, StoreError>;

    /// Fetch a sub-resource by kind, namespace and object name.
    async fn get_sub_resource(
        &self,
        kind: SubResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SubResource>, StoreError>;

    async fn create_sub_resource(&self, resource: &SubResource) -> Result<(), StoreError>;

    /// Bring an existing sub-resource to the given shape (server-side apply).
    async fn patch_sub_resource(&self, resource: &SubResource) -> Result<(), StoreError>;

    /// Delete a sub-resource. Returns `false` when it was already gone.
    async fn delete_sub_resource(
        &self,
        kind: SubResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, StoreError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;
}

/// `ClusterStore` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    /// `None` lists across all namespaces
    namespace: Option<String>,
}

impl KubeStore {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn code_servers(&self, namespace: &str) -> Api<CodeServer> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Merge patch for the status subresource.
    ///
    /// Every field is written explicitly so cleared values become `null` and
    /// are removed. Including `metadata.resourceVersion` turns the patch into
    /// a conditional write.
    pub(crate) fn status_patch(resource_version: Option<&str>, status: &CodeServerStatus) -> serde_json::Value {
        serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": {
                "phase": status.phase.as_str(),
                "observedGeneration": status.observed_generation,
                "probeFailureCount": status.probe_failure_count,
                "lastProbeTime": status.last_probe_time,
                "probeEndpoint": status.probe_endpoint,
                "url": status.url,
                "reconcileFailures": status.reconcile_failures,
                "conditions": status.conditions,
            }
        })
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, StoreError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn create<K>(api: Api<K>, object: &K) -> Result<(), StoreError>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    api.create(&PostParams::default(), object).await?;
    Ok(())
}

async fn apply<K>(api: Api<K>, name: &str, object: &K) -> Result<(), StoreError>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(object))
        .await?;
    Ok(())
}

async fn delete<K>(api: Api<K>, name: &str) -> Result<bool, StoreError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_code_server(&self, key: &ResourceKey) -> Result<Option<CodeServer>, StoreError> {
        get_opt(self.code_servers(&key.namespace), &key.name).await
    }

    async fn list_code_servers(&self) -> Result<Vec<CodeServer>, StoreError> {
        let api: Api<CodeServer> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn write_status(
        &self,
        key: &ResourceKey,
        resource_version: Option<&str>,
        status: &CodeServerStatus,
    ) -> Result<Option<String>, StoreError> {
        debug!("Writing status for {} (phase {})", key, status.phase);
        let patch = Self::status_patch(resource_version, status);
        let updated = self
            .code_servers(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(updated.metadata.resource_version)
    }

    async fn set_finalizers(
        &self,
        key: &ResourceKey,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<Option<String>, StoreError> {
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            }
        });
        let updated = self
            .code_servers(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(updated.metadata.resource_version)
    }

    async fn get_sub_resource(
        &self,
        kind: SubResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SubResource>, StoreError> {
        Ok(match kind {
            SubResourceKind::Secret => get_opt::<Secret>(self.api(namespace), name)
                .await?
                .map(SubResource::Secret),
            SubResourceKind::Deployment => get_opt::<Deployment>(self.api(namespace), name)
                .await?
                .map(SubResource::Deployment),
            SubResourceKind::Service => get_opt::<Service>(self.api(namespace), name)
                .await?
                .map(SubResource::Service),
            SubResourceKind::Ingress => get_opt::<Ingress>(self.api(namespace), name)
                .await?
                .map(SubResource::Ingress),
        })
    }

    async fn create_sub_resource(&self, resource: &SubResource) -> Result<(), StoreError> {
        let ns = resource.namespace();
        match resource {
            SubResource::Secret(o) => create(self.api(&ns), o).await,
            SubResource::Deployment(o) => create(self.api(&ns), o).await,
            SubResource::Service(o) => create(self.api(&ns), o).await,
            SubResource::Ingress(o) => create(self.api(&ns), o).await,
        }
    }

    async fn patch_sub_resource(&self, resource: &SubResource) -> Result<(), StoreError> {
        let ns = resource.namespace();
        let name = resource.name();
        match resource {
            SubResource::Secret(o) => apply(self.api(&ns), &name, o).await,
            SubResource::Deployment(o) => apply(self.api(&ns), &name, o).await,
            SubResource::Service(o) => apply(self.api(&ns), &name, o).await,
            SubResource::Ingress(o) => apply(self.api(&ns), &name, o).await,
        }
    }

    async fn delete_sub_resource(
        &self,
        kind: SubResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        match kind {
            SubResourceKind::Secret => delete::<Secret>(self.api(namespace), name).await,
            SubResourceKind::Deployment => delete::<Deployment>(self.api(namespace), name).await,
            SubResourceKind::Service => delete::<Service>(self.api(namespace), name).await,
            SubResourceKind::Ingress => delete::<Ingress>(self.api(namespace), name).await,
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        get_opt(self.api(namespace), name).await
    }
}
