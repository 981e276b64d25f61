//! Ensure and delete operations for the closed set of sub-resource kinds.

use crate::config::Options;
use crate::error::ControllerError;
use crate::request::ResourceKey;
use crate::resources::{DesiredState, SubResource, SubResourceKind};
use crate::store::ClusterStore;
use tracing::{debug, info};

/// What `ensure` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Unchanged,
    Deleted,
    /// Not wanted and not present (or present but not ours)
    Absent,
    /// Referenced object exists
    Verified,
}

#[derive(Debug, Clone)]
pub struct Ensured {
    pub action: Action,
    /// The object as found, when it already matched. Freshly written objects
    /// carry no status yet and are reported as `None`.
    pub current: Option<SubResource>,
}

impl Ensured {
    fn new(action: Action, current: Option<SubResource>) -> Self {
        Self { action, current }
    }
}

/// Converge one kind for `key` toward `desired`.
pub async fn ensure(
    store: &dyn ClusterStore,
    key: &ResourceKey,
    kind: SubResourceKind,
    desired: DesiredState,
    options: &Options,
) -> Result<Ensured, ControllerError> {
    let name = kind.object_name(key, options);
    let existing = store.get_sub_resource(kind, &key.namespace, &name).await?;

    match desired {
        DesiredState::Referenced { name } => match existing {
            Some(found) => Ok(Ensured::new(Action::Verified, Some(found))),
            None => Err(ControllerError::DependencyMissing(format!(
                "{} {}/{} required by {}",
                kind, key.namespace, name, key
            ))),
        },
        DesiredState::Present(object) => match existing {
            None => {
                info!("Creating {} {}/{}", kind, key.namespace, name);
                store.create_sub_resource(&object).await?;
                Ok(Ensured::new(Action::Created, None))
            }
            Some(actual) if !actual.is_managed() || actual.drifted_from(&object) => {
                info!("Updating drifted {} {}/{}", kind, key.namespace, name);
                store.patch_sub_resource(&object).await?;
                Ok(Ensured::new(Action::Updated, None))
            }
            Some(actual) => Ok(Ensured::new(Action::Unchanged, Some(actual))),
        },
        DesiredState::Absent => {
            let removed = match existing {
                Some(actual) => delete_found(store, &actual).await?,
                None => false,
            };
            Ok(Ensured::new(if removed { Action::Deleted } else { Action::Absent }, None))
        }
    }
}

/// Delete one managed sub-resource. Returns `false` when there was nothing of ours to delete.
///
/// Secrets are never deleted, and objects without the managed-by label are left alone.
pub async fn delete(
    store: &dyn ClusterStore,
    kind: SubResourceKind,
    namespace: &str,
    name: &str,
) -> Result<bool, ControllerError> {
    if kind == SubResourceKind::Secret {
        return Ok(false);
    }
    match store.get_sub_resource(kind, namespace, name).await? {
        Some(found) => delete_found(store, &found).await,
        None => Ok(false),
    }
}

async fn delete_found(store: &dyn ClusterStore, found: &SubResource) -> Result<bool, ControllerError> {
    let kind = found.kind();
    let (namespace, name) = (found.namespace(), found.name());
    if kind == SubResourceKind::Secret || !found.is_managed() {
        debug!("Leaving unmanaged {} {}/{} in place", kind, namespace, name);
        return Ok(false);
    }
    let removed = store.delete_sub_resource(kind, &namespace, &name).await?;
    if removed {
        info!("Deleted {} {}/{}", kind, namespace, name);
    }
    Ok(removed)
}
