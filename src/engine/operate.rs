use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::engine::deploy::build_deployment;
use crate::engine::model::{Action, ErrorReason, Install, InstallStatus, PendingUpgrade};
use crate::engine::params;
use crate::engine::ports::PortAllocator;
use crate::engine::records::Records;
use crate::error::{EngineError, Result};
use crate::runtime::{ContainerRuntime, Deployment, Target};

/// Bounds on runtime calls made while operating an install.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Upper bound for start, stop, pull+recreate and teardown.
    pub operation: Duration,
    /// Grace period handed to the runtime before it kills a container.
    pub stop_secs: i32,
    /// Upper bound for the post-upgrade health probe.
    pub health: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            operation: Duration::from_secs(600),
            stop_secs: 10,
            health: Duration::from_secs(60),
        }
    }
}

/// How a bounded runtime call ended when it did not succeed.
#[derive(Debug)]
enum StepError {
    Failed(anyhow::Error),
    TimedOut(Duration),
    Interrupted,
}

impl StepError {
    fn reason(&self, during: &str) -> ErrorReason {
        match self {
            StepError::Interrupted => ErrorReason::Interrupted {
                during: during.to_string(),
            },
            other => ErrorReason::RuntimeFailure {
                detail: other.detail(during),
            },
        }
    }

    fn detail(&self, during: &str) -> String {
        match self {
            StepError::Failed(e) => format!("{e:#}"),
            StepError::TimedOut(after) => format!("{during} timed out after {after:?}"),
            StepError::Interrupted => format!("{during} interrupted by shutdown"),
        }
    }

    fn into_error(self, during: &str) -> EngineError {
        match self {
            StepError::Failed(e) => EngineError::runtime(e.context(during.to_string())),
            other => EngineError::Runtime {
                detail: other.detail(during),
            },
        }
    }
}

/// Drives installs through their lifecycle by calling the container runtime
/// and persisting every resulting status.
///
/// Callers hold the install's lock for the whole call.
pub struct OperationStateMachine {
    runtime: Arc<dyn ContainerRuntime>,
    records: Arc<Records>,
    catalog: Arc<Catalog>,
    ports: Arc<PortAllocator>,
    timeouts: Timeouts,
    cancel: CancellationToken,
}

impl OperationStateMachine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        records: Arc<Records>,
        catalog: Arc<Catalog>,
        ports: Arc<PortAllocator>,
        timeouts: Timeouts,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            records,
            catalog,
            ports,
            timeouts,
            cancel,
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Run one runtime call, bounded by `limit` and by shutdown.
    async fn step<T>(
        &self,
        limit: Duration,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> std::result::Result<T, StepError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StepError::Interrupted),
            res = tokio::time::timeout(limit, fut) => match res {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(StepError::Failed(e)),
                Err(_) => Err(StepError::TimedOut(limit)),
            },
        }
    }

    /// Record a failed step on the install and return the error to surface.
    fn fail(&self, install: &mut Install, err: StepError, during: &str) -> EngineError {
        warn!(
            install = install.id,
            app = %install.app_key,
            error = %err.detail(during),
            "{during} failed"
        );
        install.set_status(InstallStatus::Error, Some(err.reason(during)));
        self.commit_best_effort(install);
        err.into_error(during)
    }

    /// Persist a failure status. The runtime error is what the caller sees,
    /// so a store error here is only logged and the status is still shown to
    /// readers.
    fn commit_best_effort(&self, install: &Install) {
        if let Err(e) = self.records.commit(install) {
            warn!(install = install.id, error = %e, "could not persist install status");
            self.records.publish_unpersisted(install);
        }
    }

    /// The store refused the last write of an in-flight operation. Readers
    /// see `Error{Interrupted}`; the stored in-flight status is resolved the
    /// same way on the next startup.
    fn interrupted(&self, install: &mut Install, during: &str, err: &EngineError) {
        warn!(
            install = install.id,
            app = %install.app_key,
            error = %err,
            "could not persist the outcome of {during}"
        );
        install.pending_upgrade = None;
        install.set_status(
            InstallStatus::Error,
            Some(ErrorReason::Interrupted {
                during: during.to_string(),
            }),
        );
        self.records.publish_unpersisted(install);
    }

    /// Deployment to recreate from when the containers predate the current
    /// parameters.
    fn redeployment(&self, install: &Install) -> Result<Option<Deployment>> {
        if !install.redeploy_pending {
            return Ok(None);
        }
        let template = self.catalog.template(&install.app_key)?;
        build_deployment(install, template, &install.version).map(Some)
    }

    /// Start the containers, or recreate them running when `deployment` is
    /// given.
    async fn bring_up(
        &self,
        target: &Target,
        deployment: Option<&Deployment>,
    ) -> std::result::Result<(), StepError> {
        match deployment {
            Some(deployment) => {
                info!(
                    install = target.install_id,
                    "recreating containers with updated parameters"
                );
                self.step(self.timeouts.operation, async {
                    self.runtime.pull(deployment).await?;
                    self.runtime.recreate(deployment, true).await
                })
                .await
            }
            None => {
                self.step(self.timeouts.operation, self.runtime.start(target))
                    .await
            }
        }
    }

    pub async fn operate(
        &self,
        install: Install,
        action: Action,
        target_version: Option<String>,
    ) -> Result<Install> {
        match action {
            Action::Start => self.start(install).await,
            Action::Stop => self.stop(install).await,
            Action::Restart => self.restart(install).await,
            Action::Upgrade => {
                let version = target_version.ok_or_else(|| {
                    EngineError::validation("upgrade requires a target version")
                })?;
                self.upgrade(install, &version).await
            }
        }
    }

    pub async fn start(&self, mut install: Install) -> Result<Install> {
        match install.status {
            InstallStatus::Running => return Ok(install),
            InstallStatus::Stopped | InstallStatus::Error => {}
            from => return Err(EngineError::invalid_transition(install.id, from, Action::Start)),
        }
        let target = Target::for_install(&install);
        let deployment = self.redeployment(&install)?;
        if let Err(e) = self.bring_up(&target, deployment.as_ref()).await {
            return Err(self.fail(&mut install, e, "start"));
        }
        install.redeploy_pending = false;
        install.set_status(InstallStatus::Running, None);
        self.records.commit(&install)?;
        info!(install = install.id, app = %install.app_key, "install started");
        Ok(install)
    }

    pub async fn stop(&self, mut install: Install) -> Result<Install> {
        match install.status {
            InstallStatus::Stopped => return Ok(install),
            InstallStatus::Running => {}
            from => return Err(EngineError::invalid_transition(install.id, from, Action::Stop)),
        }
        let target = Target::for_install(&install);
        if let Err(e) = self
            .step(
                self.timeouts.operation,
                self.runtime.stop(&target, self.timeouts.stop_secs),
            )
            .await
        {
            return Err(self.fail(&mut install, e, "stop"));
        }
        install.set_status(InstallStatus::Stopped, None);
        self.records.commit(&install)?;
        info!(install = install.id, app = %install.app_key, "install stopped");
        Ok(install)
    }

    pub async fn restart(&self, mut install: Install) -> Result<Install> {
        match install.status {
            InstallStatus::Running | InstallStatus::Error => {}
            from => {
                return Err(EngineError::invalid_transition(
                    install.id,
                    from,
                    Action::Restart,
                ))
            }
        }
        let target = Target::for_install(&install);
        let deployment = self.redeployment(&install)?;
        if let Err(e) = self
            .step(
                self.timeouts.operation,
                self.runtime.stop(&target, self.timeouts.stop_secs),
            )
            .await
        {
            return Err(self.fail(&mut install, e, "restart"));
        }
        if let Err(e) = self.bring_up(&target, deployment.as_ref()).await {
            return Err(self.fail(&mut install, e, "restart"));
        }
        install.redeploy_pending = false;
        install.set_status(InstallStatus::Running, None);
        self.records.commit(&install)?;
        info!(install = install.id, app = %install.app_key, "install restarted");
        Ok(install)
    }

    /// Move the install to `version`. The version only changes once the
    /// recreated containers pass their health probe.
    pub async fn upgrade(&self, mut install: Install, version: &str) -> Result<Install> {
        let resume = match install.status {
            InstallStatus::Running | InstallStatus::Stopped => install.status,
            from => {
                return Err(EngineError::invalid_transition(
                    install.id,
                    from,
                    Action::Upgrade,
                ))
            }
        };
        let template = self.catalog.template(&install.app_key)?;
        let deployment = build_deployment(&install, template, version)?;
        let rendered = params::render_config(template, &install.params, version)?;

        install.pending_upgrade = Some(PendingUpgrade {
            from_version: install.version.clone(),
            to_version: version.to_string(),
            resume,
        });
        install.set_status(InstallStatus::Upgrading, None);
        self.records.commit(&install)?;
        info!(
            install = install.id,
            app = %install.app_key,
            from = %install.version,
            to = %version,
            "upgrading install"
        );

        let start = resume == InstallStatus::Running;
        let outcome = match self
            .step(self.timeouts.operation, async {
                self.runtime.pull(&deployment).await?;
                self.runtime.recreate(&deployment, start).await
            })
            .await
        {
            Ok(()) => {
                self.step(
                    self.timeouts.health,
                    self.runtime.probe(&deployment, &template.health, start),
                )
                .await
            }
            Err(e) => Err(e),
        };

        install.pending_upgrade = None;
        if let Err(e) = outcome {
            let during = format!("upgrade to {version}");
            warn!(
                install = install.id,
                app = %install.app_key,
                error = %e.detail(&during),
                "upgrade failed, version left at {}",
                install.version
            );
            let reason = match &e {
                StepError::Interrupted => e.reason(&during),
                _ => ErrorReason::UpgradeFailed {
                    attempted_version: version.to_string(),
                    detail: e.detail(&during),
                },
            };
            install.set_status(InstallStatus::Error, Some(reason));
            self.commit_best_effort(&install);
            return Err(e.into_error(&during));
        }

        let mut upgraded = install.clone();
        upgraded.version = version.to_string();
        upgraded.rendered_config = rendered;
        upgraded.redeploy_pending = false;
        upgraded.set_status(resume, None);
        if let Err(e) = self.records.commit(&upgraded) {
            self.interrupted(&mut install, &format!("upgrade to {version}"), &e);
            return Err(e);
        }
        info!(install = install.id, app = %install.app_key, version = %version, "upgrade complete");
        Ok(upgraded)
    }

    /// Republish the ports recorded on `install`. Running installs come back
    /// up; anything else is recreated stopped. Status is left to the caller.
    pub async fn remap_ports(&self, install: &Install) -> Result<()> {
        let template = self.catalog.template(&install.app_key)?;
        let deployment = build_deployment(install, template, &install.version)?;
        let start = install.status == InstallStatus::Running;
        self.step(
            self.timeouts.operation,
            self.runtime.remap_ports(&deployment, start),
        )
        .await
        .map_err(|e| e.into_error("port change"))
    }

    /// Tear down the install's containers, volumes and network, release its
    /// ports and purge the record. Dependents must have been checked first.
    ///
    /// With `force`, teardown failures are logged and the record is purged
    /// anyway.
    pub async fn delete(&self, mut install: Install, force: bool) -> Result<()> {
        match install.status {
            InstallStatus::Stopped | InstallStatus::Error => {}
            from => {
                return Err(EngineError::InvalidTransition {
                    install: install.id,
                    from,
                    action: "delete".to_string(),
                })
            }
        }
        install.set_status(InstallStatus::Deleting, None);
        self.records.commit(&install)?;

        let target = Target::for_install(&install);
        if let Err(e) = self
            .step(self.timeouts.operation, self.runtime.remove(&target, true))
            .await
        {
            if force && !matches!(e, StepError::Interrupted) {
                warn!(
                    install = install.id,
                    error = %e.detail("teardown"),
                    "teardown failed, deleting record anyway"
                );
            } else {
                return Err(self.fail(&mut install, e, "delete"));
            }
        }

        install.set_status(InstallStatus::Deleted, None);
        if let Err(e) = self.records.commit(&install) {
            // Ports stay reserved until the deletion is on record.
            self.interrupted(&mut install, "delete", &e);
            return Err(e);
        }
        let released = self.ports.release_all(install.id);
        self.records.purge(install.id)?;
        info!(
            install = install.id,
            app = %install.app_key,
            ports = released,
            "install deleted"
        );
        Ok(())
    }
}
