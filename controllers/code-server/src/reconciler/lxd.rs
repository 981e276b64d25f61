//! LXD runtime
//!
//! Instances with `runtime: Lxd` run as containers on an external LXD host
//! instead of a Deployment. The instance is named `<namespace>-<name>` and
//! probed directly on its address.

use super::status::Observation;
use super::Reconciler;
use crate::error::ControllerError;
use crate::request::ResourceKey;
use crds::CodeServer;
use lxd_client::{CreateInstanceRequest, LxdClientTrait, LxdError};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Config key recording the image the instance was created for.
pub const IMAGE_CONFIG_KEY: &str = "user.code-server.image";

pub(crate) fn instance_name(key: &ResourceKey) -> String {
    format!("{}-{}", key.namespace, key.name)
}

/// Instance config derived from the spec.
pub(crate) fn instance_config(cs: &CodeServer) -> BTreeMap<String, String> {
    let mut config = BTreeMap::new();
    config.insert(IMAGE_CONFIG_KEY.to_string(), cs.spec.image.clone());
    for (name, value) in &cs.spec.env {
        config.insert(format!("environment.{}", name), value.clone());
    }
    if let Some(cpu) = &cs.spec.resources.cpu {
        match cpu.strip_suffix('m') {
            // Fractional CPUs become a CFS allowance
            Some(millis) => {
                let per_100ms = millis.parse::<f64>().map(|m| (m / 10.0).ceil() as u64).unwrap_or(100);
                config.insert("limits.cpu.allowance".to_string(), format!("{}ms/100ms", per_100ms.max(1)));
            }
            None => {
                config.insert("limits.cpu".to_string(), cpu.clone());
            }
        }
    }
    if let Some(memory) = &cs.spec.resources.memory {
        config.insert("limits.memory".to_string(), lxd_memory(memory));
    }
    config
}

/// Kubernetes memory quantity in LXD notation ("4Gi" -> "4GiB", "2G" -> "2GB").
fn lxd_memory(quantity: &str) -> String {
    const SUFFIXES: [(&str, &str); 10] = [
        ("Ki", "KiB"),
        ("Mi", "MiB"),
        ("Gi", "GiB"),
        ("Ti", "TiB"),
        ("Pi", "PiB"),
        ("k", "kB"),
        ("M", "MB"),
        ("G", "GB"),
        ("T", "TB"),
        ("P", "PB"),
    ];
    SUFFIXES
        .iter()
        .find_map(|(k8s, lxd)| quantity.strip_suffix(k8s).map(|n| format!("{}{}", n, lxd)))
        .unwrap_or_else(|| quantity.to_string())
}

/// Delete the instance backing `key`, stopping it first. Returns `false` when it did not exist.
pub(crate) async fn remove_instance(lxd: &dyn LxdClientTrait, key: &ResourceKey) -> Result<bool, LxdError> {
    let name = instance_name(key);
    let removed = lxd.delete_instance(&name).await?;
    if removed {
        info!("Deleted LXD instance {} for {}", name, key);
    }
    Ok(removed)
}

impl Reconciler {
    fn lxd(&self) -> Result<&dyn LxdClientTrait, ControllerError> {
        self.lxd
            .as_deref()
            .ok_or_else(|| ControllerError::Validation("no LXD backend configured".to_string()))
    }

    /// Ensure the instance exists and runs; ready once it reports an address.
    pub(crate) async fn converge_lxd(&self, key: &ResourceKey, cs: &CodeServer) -> Result<Observation, ControllerError> {
        let lxd = self.lxd()?;
        let spec = cs
            .spec
            .lxd
            .as_ref()
            .ok_or_else(|| ControllerError::Validation("runtime Lxd requires an lxd block".to_string()))?;
        let name = instance_name(key);

        match lxd.get_instance(&name).await? {
            None => {
                let mut request = CreateInstanceRequest::from_image(&name, &spec.image_alias);
                request.profiles = spec.profiles.clone();
                request.config = instance_config(cs);
                info!(
                    "Creating LXD instance {} for {} from {} on {}",
                    name,
                    key,
                    spec.image_alias,
                    lxd.base_url()
                );
                lxd.create_instance(&request).await?;
            }
            Some(instance) => {
                if instance.config.get(IMAGE_CONFIG_KEY) != Some(&cs.spec.image) {
                    // Reshaping would mean recreating the container and losing the workspace
                    warn!(
                        "LXD instance {} was created for a different image; delete the CodeServer to recreate it",
                        name
                    );
                }
                if !instance.is_running() {
                    info!("Starting LXD instance {} ({})", name, instance.status);
                    lxd.start_instance(&name).await?;
                }
            }
        }

        let address = lxd.instance_address(&name).await?;
        if address.is_none() {
            debug!("LXD instance {} has no address yet", name);
        }
        Ok(Observation {
            workload_ready: address.is_some(),
            probe_endpoint: address.map(|ip| {
                format!("http://{}:{}{}", ip, self.options.exporter_port, self.options.probe_path)
            }),
            url: None,
        })
    }
}
