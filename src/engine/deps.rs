use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use crate::engine::model::{DependencyRecord, InstallId, ResourceKind, ResourceRef};

/// Registry of external resources bound to installs.
///
/// Owners (websites, proxies, backup jobs) register and unregister their own
/// bindings; nothing here inspects the environment to discover them.
#[derive(Default)]
pub struct DependencyIndex {
    by_install: RwLock<BTreeMap<InstallId, BTreeSet<ResourceRef>>>,
}

impl DependencyIndex {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DependencyRecord>) -> Self {
        let index = Self::default();
        for record in records {
            index.bind(record);
        }
        index
    }

    /// Add a binding. Returns `false` if it was already present.
    pub fn bind(&self, record: &DependencyRecord) -> bool {
        let mut map = self.by_install.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(record.install_id)
            .or_default()
            .insert(record.resource.clone())
    }

    /// Remove a binding wherever it is registered. Returns the install it was
    /// bound to, if any.
    pub fn unbind(&self, resource: &ResourceRef) -> Option<InstallId> {
        let mut map = self.by_install.write().unwrap_or_else(PoisonError::into_inner);
        let owner = map
            .iter()
            .find(|(_, set)| set.iter().any(|r| same_resource(r, resource)))
            .map(|(id, _)| *id)?;
        if let Some(set) = map.get_mut(&owner) {
            set.retain(|r| !same_resource(r, resource));
            if set.is_empty() {
                map.remove(&owner);
            }
        }
        Some(owner)
    }

    /// Install that `resource` is bound to, if any.
    pub fn owner_of(&self, resource: &ResourceRef) -> Option<InstallId> {
        let map = self.by_install.read().unwrap_or_else(PoisonError::into_inner);
        map.iter()
            .find(|(_, set)| set.iter().any(|r| same_resource(r, resource)))
            .map(|(id, _)| *id)
    }

    /// Every resource bound to `install`. Empty means it is safe to delete.
    pub fn delete_check(&self, install: InstallId) -> Vec<ResourceRef> {
        let map = self.by_install.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&install)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of_kind(&self, install: InstallId, kind: &ResourceKind) -> Vec<ResourceRef> {
        self.delete_check(install)
            .into_iter()
            .filter(|r| &r.kind == kind)
            .collect()
    }

    /// Drop everything recorded for an install that no longer exists.
    pub fn forget(&self, install: InstallId) {
        let mut map = self.by_install.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(&install);
    }
}

/// Resources are identified by kind and id; the display name is informational.
fn same_resource(a: &ResourceRef, b: &ResourceRef) -> bool {
    a.kind == b.kind && a.id == b.id
}
