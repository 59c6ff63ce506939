use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::engine::model::InstallId;

/// One async mutex per install. Operations on different installs never
/// contend; the guard is released on every exit path when dropped.
#[derive(Default)]
pub struct InstallLocks {
    locks: DashMap<InstallId, Arc<Mutex<()>>>,
}

impl InstallLocks {
    fn lock_for(&self, id: InstallId) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: InstallId) -> OwnedMutexGuard<()> {
        self.lock_for(id).lock_owned().await
    }

    /// Exclusive access to `id` if nobody else holds it right now.
    pub fn try_acquire(&self, id: InstallId) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(id).try_lock_owned().ok()
    }

    /// Drop the lock entry of a purged install.
    pub fn forget(&self, id: InstallId) {
        self.locks.remove(&id);
    }
}
