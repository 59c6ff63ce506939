use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use crate::engine::model::{Install, InstallId};
use crate::error::{EngineError, Result};
use crate::store::InstallStore;

/// In-memory view of every install record, written through to the store.
///
/// The store is written first and the cache only changes once the write has
/// succeeded. [`Records::publish_unpersisted`] is the one exception.
pub struct Records {
    store: Arc<dyn InstallStore>,
    cache: RwLock<BTreeMap<InstallId, Install>>,
}

impl Records {
    pub fn new(store: Arc<dyn InstallStore>, installs: BTreeMap<InstallId, Install>) -> Self {
        Self {
            store,
            cache: RwLock::new(installs),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<InstallId, Install>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<dyn InstallStore> {
        &self.store
    }

    pub fn get(&self, id: InstallId) -> Result<Install> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("install {id}")))
    }

    pub fn find(&self, pred: impl Fn(&Install) -> bool) -> Option<Install> {
        self.read().values().find(|i| pred(i)).cloned()
    }

    /// Every install, ordered by id.
    pub fn all(&self) -> Vec<Install> {
        self.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<InstallId> {
        self.read().keys().copied().collect()
    }

    pub fn allocate_id(&self) -> Result<InstallId> {
        self.store.allocate_id().map_err(EngineError::store)
    }

    /// Persist `install`, then publish it to readers.
    pub fn commit(&self, install: &Install) -> Result<()> {
        self.store.put_install(install).map_err(EngineError::store)?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(install.id, install.clone());
        Ok(())
    }

    /// Publish `install` to readers without persisting it.
    ///
    /// Used when the store refuses the final write of an operation: the
    /// stored record keeps its in-flight status, which the next startup
    /// resolves, while readers see the `Error` status the operation ended in.
    pub fn publish_unpersisted(&self, install: &Install) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(install.id, install.clone());
    }

    /// Remove the record (and its dependency bindings) for good.
    pub fn purge(&self, id: InstallId) -> Result<()> {
        self.store.remove_install(id).map_err(EngineError::store)?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }
}
