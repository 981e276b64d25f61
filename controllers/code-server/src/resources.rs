//! Kubernetes resource builders for CodeServer
//!
//! Each `CodeServer` on the Kubernetes runtime owns a Deployment (code-server
//! plus the liveness exporter sidecar), a Service and, when allowed, an
//! Ingress. The shared TLS secret is referenced but never written.

use crate::config::Options;
use crate::request::ResourceKey;
use crds::{CodeServer, Runtime};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements, Secret,
    SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::fmt;

pub const MANAGED_BY: &str = "code-server-operator";
pub const NAME_LABEL: &str = "codeserver.dev/name";
pub const CODE_SERVER_CONTAINER: &str = "code-server";
pub const EXPORTER_CONTAINER: &str = "exporter";
pub const CODE_SERVER_PORT: i32 = 8080;
const TLS_MOUNT_PATH: &str = "/etc/code-server/tls";
const TLS_VOLUME: &str = "tls";

/// The closed set of objects a `CodeServer` depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubResourceKind {
    /// Shared TLS secret, verified but never written
    Secret,
    Deployment,
    Service,
    Ingress,
}

impl SubResourceKind {
    /// Ensure order: the secret first, the ingress last.
    pub const ALL: [SubResourceKind; 4] = [
        SubResourceKind::Secret,
        SubResourceKind::Deployment,
        SubResourceKind::Service,
        SubResourceKind::Ingress,
    ];

    /// Kinds the controller creates and therefore deletes, in deletion order.
    pub const OWNED: [SubResourceKind; 3] = [
        SubResourceKind::Ingress,
        SubResourceKind::Service,
        SubResourceKind::Deployment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SubResourceKind::Secret => "Secret",
            SubResourceKind::Deployment => "Deployment",
            SubResourceKind::Service => "Service",
            SubResourceKind::Ingress => "Ingress",
        }
    }

    /// Object name for the given `CodeServer` key.
    pub fn object_name(self, key: &ResourceKey, options: &Options) -> String {
        match self {
            SubResourceKind::Secret => options.https_secret_name.clone(),
            _ => key.name.clone(),
        }
    }
}

impl fmt::Display for SubResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete sub-resource object.
#[derive(Debug, Clone, PartialEq)]
pub enum SubResource {
    Secret(Secret),
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
}

impl SubResource {
    pub fn kind(&self) -> SubResourceKind {
        match self {
            SubResource::Secret(_) => SubResourceKind::Secret,
            SubResource::Deployment(_) => SubResourceKind::Deployment,
            SubResource::Service(_) => SubResourceKind::Service,
            SubResource::Ingress(_) => SubResourceKind::Ingress,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            SubResource::Secret(o) => &o.metadata,
            SubResource::Deployment(o) => &o.metadata,
            SubResource::Service(o) => &o.metadata,
            SubResource::Ingress(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> String {
        self.metadata().name.clone().unwrap_or_default()
    }

    pub fn namespace(&self) -> String {
        self.metadata().namespace.clone().unwrap_or_default()
    }

    /// Carries the operator's managed-by label.
    pub fn is_managed(&self) -> bool {
        self.metadata()
            .labels
            .as_ref()
            .and_then(|l| l.get("app.kubernetes.io/managed-by"))
            .is_some_and(|v| v == MANAGED_BY)
    }

    /// Whether `self` (as found in the cluster) no longer matches `desired`.
    ///
    /// Only fields the controller sets are compared; server-side defaults are ignored.
    pub fn drifted_from(&self, desired: &SubResource) -> bool {
        match (self, desired) {
            (SubResource::Deployment(actual), SubResource::Deployment(desired)) => {
                deployment_drifted(actual, desired)
            }
            (SubResource::Service(actual), SubResource::Service(desired)) => {
                service_drifted(actual, desired)
            }
            (SubResource::Ingress(actual), SubResource::Ingress(desired)) => {
                ingress_drifted(actual, desired)
            }
            (SubResource::Secret(_), SubResource::Secret(_)) => false,
            _ => true,
        }
    }
}

/// What the controller wants for one kind.
#[derive(Debug, Clone, PartialEq)]
pub enum DesiredState {
    /// Must exist with this shape
    Present(SubResource),
    /// Must exist; created by someone else
    Referenced { name: String },
    /// Must not exist (managed objects only)
    Absent,
}

/// Standard labels for a CodeServer's resources
pub fn standard_labels(cs: &CodeServer) -> BTreeMap<String, String> {
    let mut labels = selector_labels(cs);
    labels.insert("app.kubernetes.io/name".to_string(), "code-server".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), cs.name_any());
    labels.insert("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string());
    labels
}

fn selector_labels(cs: &CodeServer) -> BTreeMap<String, String> {
    BTreeMap::from([(NAME_LABEL.to_string(), cs.name_any())])
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(cs: &CodeServer) -> OwnerReference {
    OwnerReference {
        api_version: CodeServer::api_version(&()).to_string(),
        kind: CodeServer::kind(&()).to_string(),
        name: cs.name_any(),
        uid: cs.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Name of the owning `CodeServer`, if `metadata` has a controller reference to one.
pub fn owning_code_server(metadata: &ObjectMeta) -> Option<String> {
    metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true) && r.kind == CodeServer::kind(&()))
        .map(|r| r.name.clone())
}

fn object_meta(cs: &CodeServer, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cs.namespace(),
        labels: Some(standard_labels(cs)),
        owner_references: Some(vec![owner_reference(cs)]),
        ..Default::default()
    }
}

/// Public host of the instance
pub fn ingress_host(cs: &CodeServer, options: &Options) -> String {
    format!("{}.{}", cs.name_any(), options.domain_name)
}

/// Exporter endpoint reached through the Service
pub fn service_probe_endpoint(key: &ResourceKey, options: &Options) -> String {
    format!(
        "http://{}.{}.svc:{}{}",
        key.name, key.namespace, options.exporter_port, options.probe_path
    )
}

pub fn ingress_wanted(cs: &CodeServer, options: &Options) -> bool {
    options.enable_user_ingress && cs.spec.public_ingress
}

/// Desired state of `kind` for `cs`.
pub fn desired_state(kind: SubResourceKind, cs: &CodeServer, options: &Options) -> DesiredState {
    if cs.spec.runtime == Runtime::Lxd {
        return DesiredState::Absent;
    }
    match kind {
        SubResourceKind::Secret => DesiredState::Referenced {
            name: options.https_secret_name.clone(),
        },
        SubResourceKind::Deployment => DesiredState::Present(SubResource::Deployment(build_deployment(cs, options))),
        SubResourceKind::Service => DesiredState::Present(SubResource::Service(build_service(cs, options))),
        SubResourceKind::Ingress if ingress_wanted(cs, options) => {
            DesiredState::Present(SubResource::Ingress(build_ingress(cs, options)))
        }
        SubResourceKind::Ingress => DesiredState::Absent,
    }
}

// ============================================================================
// Deployment
// ============================================================================

pub fn build_deployment(cs: &CodeServer, options: &Options) -> Deployment {
    let labels = standard_labels(cs);

    Deployment {
        metadata: object_meta(cs, cs.name_any()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(cs)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(build_pod_spec(cs, options)),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn build_pod_spec(cs: &CodeServer, options: &Options) -> PodSpec {
    PodSpec {
        containers: vec![
            build_code_server_container(cs),
            build_exporter_container(cs, options),
        ],
        volumes: Some(vec![Volume {
            name: TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(options.https_secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn build_code_server_container(cs: &CodeServer) -> Container {
    let env: Vec<EnvVar> = cs
        .spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    Container {
        name: CODE_SERVER_CONTAINER.to_string(),
        image: Some(cs.spec.image.clone()),
        args: Some(vec![
            "--bind-addr".to_string(),
            format!("0.0.0.0:{}", CODE_SERVER_PORT),
            "--cert".to_string(),
            format!("{}/tls.crt", TLS_MOUNT_PATH),
            "--cert-key".to_string(),
            format!("{}/tls.key", TLS_MOUNT_PATH),
        ]),
        env: (!env.is_empty()).then_some(env),
        ports: Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: CODE_SERVER_PORT,
            ..Default::default()
        }]),
        resources: build_resources(cs),
        volume_mounts: Some(vec![VolumeMount {
            name: TLS_VOLUME.to_string(),
            mount_path: TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn build_exporter_container(cs: &CodeServer, options: &Options) -> Container {
    let image = cs
        .spec
        .exporter_image
        .clone()
        .filter(|i| !i.trim().is_empty())
        .unwrap_or_else(|| options.exporter_image.clone());

    Container {
        name: EXPORTER_CONTAINER.to_string(),
        image: Some(image),
        ports: Some(vec![ContainerPort {
            name: Some("exporter".to_string()),
            container_port: i32::from(options.exporter_port),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn build_resources(cs: &CodeServer) -> Option<ResourceRequirements> {
    let mut limits = BTreeMap::new();
    if let Some(cpu) = &cs.spec.resources.cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &cs.spec.resources.memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        limits: Some(limits),
        ..Default::default()
    })
}

fn container<'a>(deployment: &'a Deployment, name: &str) -> Option<&'a Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == name)
}

fn env_pairs(container: &Container) -> Vec<(&str, Option<&str>)> {
    let mut pairs: Vec<_> = container
        .env
        .iter()
        .flatten()
        .map(|e| (e.name.as_str(), e.value.as_deref()))
        .collect();
    pairs.sort_unstable();
    pairs
}

fn limits(container: &Container) -> Option<&BTreeMap<String, Quantity>> {
    container.resources.as_ref()?.limits.as_ref()
}

fn secret_volume(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .volumes
        .iter()
        .flatten()
        .find(|v| v.name == TLS_VOLUME)?
        .secret
        .as_ref()?
        .secret_name
        .as_deref()
}

fn deployment_drifted(actual: &Deployment, desired: &Deployment) -> bool {
    let replicas = |d: &Deployment| d.spec.as_ref().and_then(|s| s.replicas);
    if replicas(actual) != replicas(desired) || secret_volume(actual) != secret_volume(desired) {
        return true;
    }
    for name in [CODE_SERVER_CONTAINER, EXPORTER_CONTAINER] {
        match (container(actual, name), container(desired, name)) {
            (Some(a), Some(d)) => {
                let port = |c: &Container| {
                    c.ports
                        .iter()
                        .flatten()
                        .map(|p| p.container_port)
                        .collect::<Vec<_>>()
                };
                if a.image != d.image
                    || a.args != d.args
                    || env_pairs(a) != env_pairs(d)
                    || limits(a) != limits(d)
                    || port(a) != port(d)
                {
                    return true;
                }
            }
            (None, None) => {}
            _ => return true,
        }
    }
    false
}

/// The Deployment has at least one available, up-to-date replica.
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let Some(status) = &deployment.status else {
        return false;
    };
    let generation_seen = match (deployment.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        _ => true,
    };
    generation_seen && status.ready_replicas.unwrap_or(0) >= 1
}

// ============================================================================
// Service
// ============================================================================

pub fn build_service(cs: &CodeServer, options: &Options) -> Service {
    Service {
        metadata: object_meta(cs, cs.name_any()),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(cs)),
            ports: Some(vec![
                ServicePort {
                    name: Some("https".to_string()),
                    port: CODE_SERVER_PORT,
                    target_port: Some(IntOrString::Int(CODE_SERVER_PORT)),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("exporter".to_string()),
                    port: i32::from(options.exporter_port),
                    target_port: Some(IntOrString::Int(i32::from(options.exporter_port))),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

fn service_drifted(actual: &Service, desired: &Service) -> bool {
    let ports = |s: &Service| {
        let mut ports: Vec<(Option<String>, i32, Option<IntOrString>)> = s
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|p| (p.name, p.port, p.target_port))
            .collect();
        ports.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        ports
    };
    let selector = |s: &Service| s.spec.as_ref().and_then(|spec| spec.selector.clone());
    ports(actual) != ports(desired) || selector(actual) != selector(desired)
}

// ============================================================================
// Ingress
// ============================================================================

pub fn build_ingress(cs: &CodeServer, options: &Options) -> Ingress {
    let host = ingress_host(cs, options);
    let mut metadata = object_meta(cs, cs.name_any());
    metadata.annotations = Some(BTreeMap::from([(
        "nginx.ingress.kubernetes.io/backend-protocol".to_string(),
        "HTTPS".to_string(),
    )]));

    Ingress {
        metadata,
        spec: Some(IngressSpec {
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![host.clone()]),
                secret_name: Some(options.https_secret_name.clone()),
            }]),
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: cs.name_any(),
                                port: Some(ServiceBackendPort {
                                    number: Some(CODE_SERVER_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

fn ingress_drifted(actual: &Ingress, desired: &Ingress) -> bool {
    let spec = |i: &Ingress| i.spec.clone().map(|s| (s.rules, s.tls));
    spec(actual) != spec(desired)
}

/// Public URL served through the ingress
pub fn ingress_url(cs: &CodeServer, options: &Options) -> String {
    format!("https://{}", ingress_host(cs, options))
}

#[cfg(test)]
#[path = "resources_test.rs"]
mod resources_test;
