//! Test utilities for unit testing the control loop
//!
//! An in-memory `ClusterStore` that behaves like the API server for the
//! operations the controller uses (resource versions, finalizers, 404/409),
//! a scriptable prober, and fixtures.

use crate::config::Options;
use crate::probe::{ProbeOutcome, Prober};
use crate::request::ResourceKey;
use crate::resources::{SubResource, SubResourceKind};
use crate::store::{ClusterStore, StoreError};
use async_trait::async_trait;
use crds::{CodeServer, CodeServerSpec, CodeServerStatus, Phase};
use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const TEST_IMAGE: &str = "codercom/code-server:4.16.1";

/// Helper to create a test CodeServer
pub fn create_test_code_server(namespace: &str, name: &str) -> CodeServer {
    CodeServer {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}", name)),
            generation: Some(1),
            ..Default::default()
        },
        spec: CodeServerSpec {
            image: TEST_IMAGE.to_string(),
            ..Default::default()
        },
        status: None,
    }
}

/// Helper to create a CodeServer already reconciled into `phase`
pub fn create_test_code_server_with_status(
    namespace: &str,
    name: &str,
    phase: Phase,
    probe_failure_count: u32,
) -> CodeServer {
    let mut cs = create_test_code_server(namespace, name);
    cs.status = Some(CodeServerStatus {
        phase,
        observed_generation: Some(1),
        probe_failure_count,
        ..Default::default()
    });
    cs
}

/// Options with test-friendly timings
pub fn test_options() -> Options {
    Options {
        probe_interval: Duration::from_secs(20),
        probe_timeout: Duration::from_secs(5),
        backoff_min: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
        ..Options::default()
    }
}

fn deletion_time() -> Time {
    serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).unwrap()
}

#[derive(Default)]
struct StoreState {
    code_servers: BTreeMap<ResourceKey, CodeServer>,
    sub_resources: BTreeMap<(SubResourceKind, String, String), SubResource>,
    secrets: BTreeMap<(String, String), Secret>,
    next_version: u64,
    mutations: Vec<String>,
    conflicts_to_inject: u32,
    failures_to_inject: u32,
}

impl StoreState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn injected_failure(&mut self) -> Result<(), StoreError> {
        if self.failures_to_inject > 0 {
            self.failures_to_inject -= 1;
            return Err(StoreError::Transient("injected 503".to_string()));
        }
        Ok(())
    }

    fn check_version(&mut self, key: &ResourceKey, resource_version: Option<&str>) -> Result<(), StoreError> {
        let current = self
            .code_servers
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?
            .metadata
            .resource_version
            .clone();
        if self.conflicts_to_inject > 0 {
            self.conflicts_to_inject -= 1;
            return Err(StoreError::Conflict(format!("injected conflict on {}", key)));
        }
        match resource_version {
            Some(expected) if current.as_deref() != Some(expected) => Err(StoreError::Conflict(format!(
                "{} has version {:?}, write expected {}",
                key, current, expected
            ))),
            _ => Ok(()),
        }
    }
}

/// In-memory `ClusterStore`
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the shared TLS secret present in `namespace`
    pub fn with_tls_secret(namespace: &str, options: &Options) -> Self {
        let store = Self::new();
        store.add_secret(namespace, &options.https_secret_name, BTreeMap::new());
        store
    }

    pub fn add_secret(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, k8s_openapi::ByteString(v)))
                    .collect(),
            ),
            ..Default::default()
        };
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    /// Insert (or replace) a CodeServer, assigning a fresh resource version
    pub fn insert(&self, mut cs: CodeServer) -> ResourceKey {
        let key = ResourceKey::from_resource(&cs).unwrap();
        let mut state = self.state.lock().unwrap();
        cs.metadata.resource_version = Some(state.bump());
        state.code_servers.insert(key.clone(), cs);
        key
    }

    /// Apply a spec edit, bumping generation and resource version
    pub fn update_spec(&self, key: &ResourceKey, edit: impl FnOnce(&mut CodeServerSpec)) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let cs = state.code_servers.get_mut(key).unwrap();
        edit(&mut cs.spec);
        cs.metadata.generation = Some(cs.metadata.generation.unwrap_or(0) + 1);
        cs.metadata.resource_version = Some(version);
    }

    /// What a user `kubectl delete` does: mark for deletion or remove outright
    pub fn request_delete(&self, key: &ResourceKey) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let Some(cs) = state.code_servers.get_mut(key) else {
            return;
        };
        if cs.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            cs.metadata.deletion_timestamp = Some(deletion_time());
            cs.metadata.resource_version = Some(version);
        } else {
            state.code_servers.remove(key);
        }
    }

    pub fn code_server(&self, key: &ResourceKey) -> Option<CodeServer> {
        self.state.lock().unwrap().code_servers.get(key).cloned()
    }

    pub fn status(&self, key: &ResourceKey) -> Option<CodeServerStatus> {
        self.code_server(key).and_then(|cs| cs.status)
    }

    pub fn phase(&self, key: &ResourceKey) -> Option<Phase> {
        self.status(key).map(|s| s.phase)
    }

    pub fn sub_resource(&self, kind: SubResourceKind, key: &ResourceKey) -> Option<SubResource> {
        self.state
            .lock()
            .unwrap()
            .sub_resources
            .get(&(kind, key.namespace.clone(), key.name.clone()))
            .cloned()
    }

    /// Put an arbitrary sub-resource in place (e.g. a leftover or a drifted copy)
    pub fn put_sub_resource(&self, resource: SubResource) {
        let mut state = self.state.lock().unwrap();
        state
            .sub_resources
            .insert((resource.kind(), resource.namespace(), resource.name()), resource);
    }

    /// Simulate the Deployment controller reporting readiness
    pub fn set_deployment_ready(&self, key: &ResourceKey, ready: bool) {
        let mut state = self.state.lock().unwrap();
        let id = (SubResourceKind::Deployment, key.namespace.clone(), key.name.clone());
        if let Some(SubResource::Deployment(deployment)) = state.sub_resources.get_mut(&id) {
            deployment.status = Some(DeploymentStatus {
                ready_replicas: Some(i32::from(ready)),
                ..Default::default()
            });
        }
    }

    /// Fail the next `n` optimistic writes with a conflict
    pub fn inject_conflicts(&self, n: u32) {
        self.state.lock().unwrap().conflicts_to_inject = n;
    }

    /// Fail the next `n` calls of any kind with a transient error
    pub fn inject_failures(&self, n: u32) {
        self.state.lock().unwrap().failures_to_inject = n;
    }

    /// Mutating calls so far, e.g. "create Deployment dev/alice"
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state.lock().unwrap().mutations.clear();
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get_code_server(&self, key: &ResourceKey) -> Result<Option<CodeServer>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.injected_failure()?;
        Ok(state.code_servers.get(key).cloned())
    }

    async fn list_code_servers(&self) -> Result<Vec<CodeServer>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.injected_failure()?;
        Ok(state.code_servers.values().cloned().collect())
    }

    async fn write_status(
        &self,
        key: &ResourceKey,
        resource_version: Option<&str>,
        status: &CodeServerStatus,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.injected_failure()?;
        state.check_version(key, resource_version)?;
        let version = state.bump();
        state.mutations.push(format!("status {} {}", key, status.phase));
        let cs = state.code_servers.get_mut(key).unwrap();
        cs.status = Some(status.clone());
        cs.metadata.resource_version = Some(version.clone());
        Ok(Some(version))
    }

    async fn set_finalizers(
        &self,
        key: &ResourceKey,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.injected_failure()?;
        state.check_version(key, resource_version)?;
        let version = state.bump();
        state.mutations.push(format!("finalizers {} {:?}", key, finalizers));
        let cs = state.code_servers.get_mut(key).unwrap();
        let release = finalizers.is_empty() && cs.metadata.deletion_timestamp.is_some();
        cs.metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);
        cs.metadata.resource_version = Some(version.clone());
        if release {
            state.code_servers.remove(key);
            return Ok(None);
        }
        Ok(Some(version))
    }

    async fn get_sub_resource(
        &self,
        kind: SubResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SubResource>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.injected_failure()?;
        if kind == SubResourceKind::Secret {
            return Ok(state
                .secrets
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .map(SubResource::Secret));
        }
        Ok(state
            .sub_resources
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_sub_resource(&self, resource: &SubResource) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.injected_failure()?;
        let id = (resource.kind(), resource.namespace(), resource.name());
        if state.sub_resources.contains_key(&id) {
            return Err(StoreError::Conflict(format!("{} {}/{} already exists", id.0, id.1, id.2)));
        }
        state.mutations.push(format!("create {} {}/{}", id.0, id.1, id.2));
        state.sub_resources.insert(id, resource.clone());
        Ok(())
    }

    async fn patch_sub_resource(&self, resource: &SubResource) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.injected_failure()?;
        let id = (resource.kind(), resource.namespace(), resource.name());
        state.mutations.push(format!("patch {} {}/{}", id.0, id.1, id.2));
        let mut updated = resource.clone();
        // Apply does not touch status
        if let (Some(SubResource::Deployment(existing)), SubResource::Deployment(new)) =
            (state.sub_resources.get(&id), &mut updated)
        {
            new.status = existing.status.clone();
        }
        state.sub_resources.insert(id, updated);
        Ok(())
    }

    async fn delete_sub_resource(
        &self,
        kind: SubResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.injected_failure()?;
        let removed = state
            .sub_resources
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .is_some();
        if removed {
            state.mutations.push(format!("delete {} {}/{}", kind, namespace, name));
        }
        Ok(removed)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.injected_failure()?;
        Ok(state.secrets.get(&(namespace.to_string(), name.to_string())).cloned())
    }
}

/// Scriptable prober
///
/// Endpoints are healthy unless marked otherwise; a hanging endpoint never answers.
#[derive(Default)]
pub struct FakeProber {
    unhealthy: Mutex<HashMap<String, bool>>,
    hanging: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, endpoint: &str, healthy: bool) {
        self.unhealthy.lock().unwrap().insert(endpoint.to_string(), !healthy);
    }

    pub fn hang(&self, endpoint: &str) {
        self.hanging.lock().unwrap().push(endpoint.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, endpoint: &str) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hangs = self.hanging.lock().unwrap().iter().any(|e| e == endpoint);
        if hangs {
            std::future::pending::<()>().await;
        }
        let unhealthy = self.unhealthy.lock().unwrap().get(endpoint).copied().unwrap_or(false);
        if unhealthy {
            ProbeOutcome::Unhealthy("connection refused".to_string())
        } else {
            ProbeOutcome::Healthy
        }
    }
}
