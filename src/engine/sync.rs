use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::engine::locks::InstallLocks;
use crate::engine::model::{ErrorReason, Install, InstallId, InstallStatus};
use crate::engine::records::Records;
use crate::runtime::{ContainerRuntime, Liveness, Target};

/// Drift found for one install during a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub install: InstallId,
    pub app_key: String,
    pub name: String,
    pub recorded: InstallStatus,
    pub observed: String,
    /// Status written back, if the record was corrected.
    pub corrected_to: Option<InstallStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub checked: usize,
    pub skipped: usize,
    pub corrected: usize,
    pub discrepancies: Vec<Discrepancy>,
    /// Another sweep was already running, so this one did nothing.
    pub sweep_skipped: bool,
}

/// Clears the in-flight flag however the sweep ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Compares recorded status with what the runtime reports and repairs drift.
pub struct SyncReconciler {
    records: Arc<Records>,
    runtime: Arc<dyn ContainerRuntime>,
    locks: Arc<InstallLocks>,
    debounce: Duration,
    inspect_timeout: Duration,
    in_flight: AtomicBool,
    last_synced: DashMap<InstallId, Instant>,
}

impl SyncReconciler {
    pub fn new(
        records: Arc<Records>,
        runtime: Arc<dyn ContainerRuntime>,
        locks: Arc<InstallLocks>,
        debounce: Duration,
        inspect_timeout: Duration,
    ) -> Self {
        Self {
            records,
            runtime,
            locks,
            debounce,
            inspect_timeout,
            in_flight: AtomicBool::new(false),
            last_synced: DashMap::new(),
        }
    }

    /// Reconcile every install. Without `force`, installs checked within the
    /// debounce window are skipped. Only one sweep runs at a time; a second
    /// caller returns at once with `sweep_skipped` set.
    pub async fn sync_all(&self, force: bool) -> SyncReport {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync already in progress, skipping");
            return SyncReport {
                sweep_skipped: true,
                ..SyncReport::default()
            };
        }
        let _guard = SweepGuard(&self.in_flight);

        let mut report = SyncReport::default();
        for id in self.records.ids() {
            self.sync_one(id, force, &mut report).await;
        }

        if report.discrepancies.is_empty() {
            debug!(checked = report.checked, skipped = report.skipped, "sync complete");
        } else {
            info!(
                checked = report.checked,
                skipped = report.skipped,
                corrected = report.corrected,
                discrepancies = report.discrepancies.len(),
                "sync complete"
            );
        }
        report
    }

    fn skip_reason(install: &Install) -> Option<&'static str> {
        if install.status == InstallStatus::Deleted {
            Some("deleted")
        } else if install.status.is_transitional() {
            Some("mid-transition")
        } else if matches!(install.error_reason, Some(ErrorReason::UpgradeFailed { .. })) {
            Some("failed upgrade awaiting operator")
        } else {
            None
        }
    }

    async fn sync_one(&self, id: InstallId, force: bool, report: &mut SyncReport) {
        if !force {
            if let Some(last) = self.last_synced.get(&id) {
                if last.elapsed() < self.debounce {
                    report.skipped += 1;
                    return;
                }
            }
        }
        // An operation holding the lock owns the status until it finishes.
        let Some(_lock) = self.locks.try_acquire(id) else {
            debug!(install = id, "install is busy, skipping");
            report.skipped += 1;
            return;
        };
        let Ok(mut install) = self.records.get(id) else {
            return;
        };
        if let Some(why) = Self::skip_reason(&install) {
            debug!(install = id, "skipping sync: {why}");
            report.skipped += 1;
            return;
        }

        report.checked += 1;
        self.last_synced.insert(id, Instant::now());

        let target = Target::for_install(&install);
        let observed =
            match tokio::time::timeout(self.inspect_timeout, self.runtime.inspect(&target)).await {
                Ok(Ok(observed)) => observed,
                Ok(Err(e)) => {
                    warn!(install = id, error = %format!("{e:#}"), "inspect failed");
                    report.discrepancies.push(discrepancy(
                        &install,
                        format!("inspect failed: {e:#}"),
                        None,
                    ));
                    return;
                }
                Err(_) => {
                    warn!(install = id, "inspect timed out");
                    report.discrepancies.push(discrepancy(
                        &install,
                        format!("inspect timed out after {:?}", self.inspect_timeout),
                        None,
                    ));
                    return;
                }
            };

        let liveness = observed.liveness();
        let Some((status, reason)) = desired(&install, liveness) else {
            return;
        };

        let recorded = install.status;
        install.set_status(status, reason);
        let observed = describe(liveness);
        match self.records.commit(&install) {
            Ok(()) => {
                info!(
                    install = id,
                    app = %install.app_key,
                    from = %recorded,
                    to = %status,
                    "corrected drift: {observed}"
                );
                report.corrected += 1;
                let mut entry = discrepancy(&install, observed, Some(status));
                entry.recorded = recorded;
                report.discrepancies.push(entry);
            }
            Err(e) => {
                warn!(install = id, error = %e, "could not persist drift correction");
                let mut entry = discrepancy(&install, observed, None);
                entry.recorded = recorded;
                report.discrepancies.push(entry);
            }
        }
    }

    /// Forget the debounce entry of a purged install.
    pub fn forget(&self, id: InstallId) {
        self.last_synced.remove(&id);
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn_loop(
        self: Arc<Self>,
        tracker: &TaskTracker,
        cancel: CancellationToken,
        interval: Duration,
    ) {
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("sync loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sync_all(false).await;
                    }
                }
            }
        });
    }
}

/// Status the record should have given what the runtime reports, or `None`
/// when it already matches.
fn desired(install: &Install, liveness: Liveness) -> Option<(InstallStatus, Option<ErrorReason>)> {
    let want = match liveness {
        Liveness::Missing => (InstallStatus::Error, Some(ErrorReason::ServicesMissing)),
        Liveness::Running => (InstallStatus::Running, None),
        Liveness::Stopped => (InstallStatus::Stopped, None),
        Liveness::Degraded { running, total } => (
            InstallStatus::Error,
            Some(ErrorReason::Degraded { running, total }),
        ),
    };
    if install.status == want.0 && install.error_reason == want.1 {
        None
    } else {
        Some(want)
    }
}

fn describe(liveness: Liveness) -> String {
    match liveness {
        Liveness::Running => "all containers running".to_string(),
        Liveness::Stopped => "all containers stopped".to_string(),
        Liveness::Missing => "containers missing".to_string(),
        Liveness::Degraded { running, total } => {
            format!("{running}/{total} containers running")
        }
    }
}

fn discrepancy(
    install: &Install,
    observed: String,
    corrected_to: Option<InstallStatus>,
) -> Discrepancy {
    Discrepancy {
        install: install.id,
        app_key: install.app_key.clone(),
        name: install.name.clone(),
        recorded: install.status,
        observed,
        corrected_to,
    }
}
