//! Finalizer handling and cleanup of owned resources.

use super::lxd::{instance_name, remove_instance};
use super::status::terminating_status;
use super::subresource;
use super::Reconciler;
use crate::error::ControllerError;
use crate::request::ResourceKey;
use crate::resources::SubResourceKind;
use chrono::Utc;
use crds::{CodeServer, Phase, CODE_SERVER_FINALIZER};
use tracing::{debug, info};

fn has_finalizer(cs: &CodeServer) -> bool {
    cs.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == CODE_SERVER_FINALIZER))
}

impl Reconciler {
    /// Add the cleanup finalizer if missing. Returns the resource version to write against.
    pub(crate) async fn ensure_finalizer(
        &self,
        key: &ResourceKey,
        cs: &CodeServer,
    ) -> Result<Option<String>, ControllerError> {
        if has_finalizer(cs) {
            return Ok(cs.metadata.resource_version.clone());
        }
        let mut finalizers = cs.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(CODE_SERVER_FINALIZER.to_string());
        let version = self
            .store
            .set_finalizers(key, cs.metadata.resource_version.as_deref(), finalizers)
            .await?;
        info!("Added finalizer to CodeServer {}", key);
        Ok(version)
    }

    /// Run cleanup for a resource marked for deletion, then release it.
    pub(crate) async fn finalize(&self, key: &ResourceKey, cs: &CodeServer) -> Result<(), ControllerError> {
        if !has_finalizer(cs) {
            debug!("CodeServer {} is being deleted without our finalizer", key);
            return Ok(());
        }

        let mut version = cs.metadata.resource_version.clone();
        let current = cs.status.clone().unwrap_or_default();
        if current.phase != Phase::Terminating {
            info!("CodeServer {} is terminating", key);
            version = self
                .store
                .write_status(key, version.as_deref(), &terminating_status(&current, Utc::now()))
                .await?;
        }

        let leftovers = self.cleanup(key).await?;
        if !leftovers.is_empty() {
            return Err(ControllerError::CleanupIncomplete(leftovers.join(", ")));
        }

        let remaining: Vec<String> = cs
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| *f != CODE_SERVER_FINALIZER)
            .cloned()
            .collect();
        self.store.set_finalizers(key, version.as_deref(), remaining).await?;
        info!("Released finalizer on CodeServer {}", key);
        Ok(())
    }

    /// Delete everything owned by `key` and report what still exists afterwards.
    ///
    /// Safe to run on an already clean key: it only reads.
    pub async fn cleanup(&self, key: &ResourceKey) -> Result<Vec<String>, ControllerError> {
        for kind in SubResourceKind::OWNED {
            subresource::delete(self.store.as_ref(), kind, &key.namespace, &key.name).await?;
        }
        if let Some(lxd) = self.lxd.as_deref() {
            remove_instance(lxd, key).await?;
        }

        let mut leftovers = Vec::new();
        for kind in SubResourceKind::OWNED {
            let found = self
                .store
                .get_sub_resource(kind, &key.namespace, &key.name)
                .await?;
            if found.is_some_and(|r| r.is_managed()) {
                leftovers.push(format!("{} {}", kind, key));
            }
        }
        if let Some(lxd) = self.lxd.as_deref() {
            let name = instance_name(key);
            if lxd.get_instance(&name).await?.is_some() {
                leftovers.push(format!("LXD instance {}", name));
            }
        }
        Ok(leftovers)
    }
}
