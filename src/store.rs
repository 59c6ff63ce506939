use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::engine::model::{DependencyRecord, Install, InstallId};

/// Everything the engine persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub next_id: InstallId,
    #[serde(default)]
    pub installs: BTreeMap<InstallId, Install>,
    #[serde(default)]
    pub dependencies: Vec<DependencyRecord>,
}

/// Keyed persistence for install records and dependency bindings.
///
/// Every write covers a single record and is durable when the call returns.
pub trait InstallStore: Send + Sync {
    fn load(&self) -> Result<StoreSnapshot>;
    fn allocate_id(&self) -> Result<InstallId>;
    fn put_install(&self, install: &Install) -> Result<()>;
    fn remove_install(&self, id: InstallId) -> Result<()>;
    fn put_dependency(&self, record: &DependencyRecord) -> Result<()>;
    fn remove_dependency(&self, record: &DependencyRecord) -> Result<()>;
}

fn apply_put_dependency(snapshot: &mut StoreSnapshot, record: &DependencyRecord) {
    snapshot.dependencies.retain(|r| {
        !(r.resource.kind == record.resource.kind && r.resource.id == record.resource.id)
    });
    snapshot.dependencies.push(record.clone());
}

fn apply_remove_dependency(snapshot: &mut StoreSnapshot, record: &DependencyRecord) {
    snapshot.dependencies.retain(|r| {
        !(r.resource.kind == record.resource.kind && r.resource.id == record.resource.id)
    });
}

fn apply_allocate(snapshot: &mut StoreSnapshot) -> InstallId {
    let floor = snapshot.installs.keys().next_back().copied().unwrap_or(0);
    snapshot.next_id = snapshot.next_id.max(floor) + 1;
    snapshot.next_id
}

// ---------------------------------------------------------------------------
// JsonFileStore
// ---------------------------------------------------------------------------

/// Stores everything in `<state_dir>/installs.json`.
///
/// Writes go to a temporary file that is renamed over the original, and every
/// read-modify-write holds an exclusive `flock` on a sibling lock file so two
/// processes sharing a state directory cannot interleave updates.
pub struct JsonFileStore {
    state_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.state_dir.join("installs.json")
    }

    fn read(&self) -> Result<StoreSnapshot> {
        let path = self.path();
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreSnapshot::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn write(&self, snapshot: &StoreSnapshot) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("creating {}", self.state_dir.display()))?;
        let path = self.path();
        let content = serde_json::to_string_pretty(snapshot)?;
        // Atomic write: write to tmp file then rename
        let tmp_path = self.state_dir.join("installs.json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    /// Acquire an exclusive file lock on installs.json.lock.
    /// Returns the lock file handle (lock released on drop).
    fn lock(&self) -> Result<std::fs::File> {
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("creating {}", self.state_dir.display()))?;
        let lock_path = self.state_dir.join("installs.json.lock");
        let lock_file = std::fs::File::create(&lock_path)
            .with_context(|| format!("opening {}", lock_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fd is valid for the lifetime of lock_file
            let rc = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                bail!(
                    "locking {}: {}",
                    lock_path.display(),
                    std::io::Error::last_os_error()
                );
            }
        }

        Ok(lock_file)
    }

    fn update<T>(&self, f: impl FnOnce(&mut StoreSnapshot) -> T) -> Result<T> {
        let _lock = self.lock()?;
        let mut snapshot = self.read()?;
        let out = f(&mut snapshot);
        self.write(&snapshot)?;
        Ok(out)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

impl InstallStore for JsonFileStore {
    fn load(&self) -> Result<StoreSnapshot> {
        let _lock = self.lock()?;
        self.read()
    }

    fn allocate_id(&self) -> Result<InstallId> {
        self.update(apply_allocate)
    }

    fn put_install(&self, install: &Install) -> Result<()> {
        self.update(|s| {
            s.installs.insert(install.id, install.clone());
        })
    }

    fn remove_install(&self, id: InstallId) -> Result<()> {
        self.update(|s| {
            s.installs.remove(&id);
            s.dependencies.retain(|r| r.install_id != id);
        })
    }

    fn put_dependency(&self, record: &DependencyRecord) -> Result<()> {
        self.update(|s| apply_put_dependency(s, record))
    }

    fn remove_dependency(&self, record: &DependencyRecord) -> Result<()> {
        self.update(|s| apply_remove_dependency(s, record))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Volatile store, used for dry runs and tests. Writes can be made to fail to
/// exercise store-outage handling.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<StoreSnapshot>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<T>(&self, f: impl FnOnce(&mut StoreSnapshot) -> T) -> Result<T> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("store is not accepting writes");
        }
        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut snapshot))
    }
}

impl InstallStore for MemoryStore {
    fn load(&self) -> Result<StoreSnapshot> {
        Ok(self.snapshot())
    }

    fn allocate_id(&self) -> Result<InstallId> {
        self.update(apply_allocate)
    }

    fn put_install(&self, install: &Install) -> Result<()> {
        self.update(|s| {
            s.installs.insert(install.id, install.clone());
        })
    }

    fn remove_install(&self, id: InstallId) -> Result<()> {
        self.update(|s| {
            s.installs.remove(&id);
            s.dependencies.retain(|r| r.install_id != id);
        })
    }

    fn put_dependency(&self, record: &DependencyRecord) -> Result<()> {
        self.update(|s| apply_put_dependency(s, record))
    }

    fn remove_dependency(&self, record: &DependencyRecord) -> Result<()> {
        self.update(|s| apply_remove_dependency(s, record))
    }
}
