pub mod deploy;
pub mod deps;
pub mod locks;
pub mod model;
pub mod operate;
pub mod params;
pub mod ports;
pub mod records;
pub mod registry;
pub mod sync;
pub mod upgrade;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::catalog::Catalog;
use crate::config::model::{AppkeeperConfig, ReservedPort};
use crate::error::{EngineError, Result};
use crate::runtime::ContainerRuntime;
use crate::store::{InstallStore, StoreSnapshot};
use deps::DependencyIndex;
use locks::InstallLocks;
use model::{ErrorReason, InstallStatus};
use operate::{OperationStateMachine, Timeouts};
use ports::{format_port_conflicts, PortAllocator};
use records::Records;
use registry::{InstallRegistry, RegistryParts};
use sync::SyncReconciler;

/// Bound on a single inspect call during a sweep.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Knobs the engine is built with, usually taken from `appkeeper.toml`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sync_interval: Duration,
    pub sync_debounce: Duration,
    pub timeouts: Timeouts,
    pub max_operations: usize,
    pub probe_host: bool,
    pub reserved: Vec<ReservedPort>,
    /// Address reported in connection info.
    pub host: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppkeeperConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &AppkeeperConfig) -> Self {
        Self {
            sync_interval: config.sync_interval(),
            sync_debounce: config.sync_debounce(),
            timeouts: Timeouts {
                operation: config.operation_timeout(),
                stop_secs: config.operations.stop_timeout_secs,
                health: config.health_timeout(),
            },
            max_operations: config.workers.max_operations,
            probe_host: config.ports.probe_host,
            reserved: config.ports.reserved.clone(),
            host: config.engine.host.clone(),
        }
    }
}

/// The assembled engine: registry, reconciler and the tasks they own.
pub struct Engine {
    registry: InstallRegistry,
    sync: Arc<SyncReconciler>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    sync_interval: Duration,
}

impl Engine {
    /// Load persisted state and wire every component.
    ///
    /// Installs left in `Upgrading` or `Deleting` by a previous process are
    /// moved to `Error` first, since nothing is driving them any more.
    pub fn open(
        settings: EngineSettings,
        catalog: Arc<Catalog>,
        store: Arc<dyn InstallStore>,
        runtime: Arc<dyn ContainerRuntime>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let mut snapshot = store.load().map_err(EngineError::store)?;
        resolve_interrupted(store.as_ref(), &mut snapshot)?;

        let ports = Arc::new(PortAllocator::new(settings.probe_host));
        for reserved in &settings.reserved {
            if let Err(conflict) =
                ports.reserve_system(reserved.port, reserved.protocol, &reserved.owner)
            {
                warn!("{}", format_port_conflicts(&[conflict]));
            }
        }
        let mut conflicts = Vec::new();
        for install in snapshot.installs.values() {
            if install.status == InstallStatus::Deleted {
                continue;
            }
            if let Err(conflict) = ports.restore(install.id, &install.ports) {
                conflicts.push(conflict);
            }
        }
        if !conflicts.is_empty() {
            warn!("{}", format_port_conflicts(&conflicts));
        }

        let deps = Arc::new(DependencyIndex::from_records(&snapshot.dependencies));
        let install_count = snapshot.installs.len();
        let records = Arc::new(Records::new(store, snapshot.installs));
        let locks = Arc::new(InstallLocks::default());
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let machine = Arc::new(OperationStateMachine::new(
            runtime.clone(),
            records.clone(),
            catalog.clone(),
            ports.clone(),
            settings.timeouts,
            cancel.child_token(),
        ));
        let sync = Arc::new(SyncReconciler::new(
            records.clone(),
            runtime,
            locks.clone(),
            settings.sync_debounce,
            INSPECT_TIMEOUT,
        ));
        let registry = InstallRegistry::new(RegistryParts {
            catalog,
            records,
            ports,
            deps,
            locks,
            machine,
            sync: sync.clone(),
            audit,
            tracker: tracker.clone(),
            cancel: cancel.clone(),
            max_operations: settings.max_operations,
            host: settings.host,
        });

        info!(installs = install_count, "engine opened");
        Ok(Self {
            registry,
            sync,
            tracker,
            cancel,
            sync_interval: settings.sync_interval,
        })
    }

    pub fn registry(&self) -> &InstallRegistry {
        &self.registry
    }

    /// Start the periodic sweep. It stops when the engine shuts down.
    pub fn spawn_sync_loop(&self) {
        self.sync
            .clone()
            .spawn_loop(&self.tracker, self.cancel.clone(), self.sync_interval);
    }

    /// Cancel in-flight operations and wait up to `grace` for every tracked
    /// task to finish. Returns `false` if the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cancel.cancel();
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("engine stopped");
                true
            }
            Err(_) => {
                warn!(
                    tasks = self.tracker.len(),
                    "tasks still running after {:?}", grace
                );
                false
            }
        }
    }
}

/// Move installs stuck in an in-flight status to `Error{Interrupted}`.
fn resolve_interrupted(store: &dyn InstallStore, snapshot: &mut StoreSnapshot) -> Result<()> {
    for install in snapshot.installs.values_mut() {
        let during = match install.status {
            InstallStatus::Upgrading => "upgrade",
            InstallStatus::Deleting => "delete",
            _ => continue,
        };
        install.set_status(
            InstallStatus::Error,
            Some(ErrorReason::Interrupted {
                during: during.to_string(),
            }),
        );
        install.pending_upgrade = None;
        store.put_install(install).map_err(EngineError::store)?;
        warn!(
            install = install.id,
            app = %install.app_key,
            "{} was interrupted by a restart, marked as error", during
        );
    }
    Ok(())
}
