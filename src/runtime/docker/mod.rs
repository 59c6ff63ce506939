pub mod container;
pub mod image;
pub mod network;
pub mod volume;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use std::time::Duration;

use crate::catalog::HealthCheck;
use crate::runtime::health::{self, probe_timeout};
use crate::runtime::{ContainerRuntime, ContainerState, Deployment, Observed, Target};
use network::resource_labels;

/// Whether Docker answered 404 for the resource.
pub(crate) fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Treat a 404 as success; teardown of something already gone is done.
pub(crate) fn gone_is_ok(
    result: std::result::Result<(), bollard::errors::Error>,
    what: impl FnOnce() -> String,
) -> Result<()> {
    match result {
        Err(e) if !is_not_found(&e) => Err(e).with_context(what),
        _ => Ok(()),
    }
}

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    /// Host used for TCP/HTTP health checks against published ports.
    probe_host: String,
    health_limit: Duration,
}

impl DockerRuntime {
    /// Client for the local Docker daemon. Nothing is sent until the first
    /// call.
    pub fn new(probe_host: impl Into<String>, health_limit: Duration) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("connecting to Docker daemon")?;
        Ok(Self {
            docker,
            probe_host: probe_host.into(),
            health_limit,
        })
    }

    /// Connect to the local Docker daemon, verifying it answers.
    pub async fn connect(probe_host: impl Into<String>, health_limit: Duration) -> Result<Self> {
        let runtime = Self::new(probe_host, health_limit)?;
        runtime
            .docker
            .ping()
            .await
            .context("Cannot connect to Docker daemon. Is Docker running?")?;
        Ok(runtime)
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    async fn observe(&self, containers: &[String]) -> Result<Observed> {
        let mut observed = Observed::default();
        for name in containers {
            let state = container::container_state(&self.docker, name).await?;
            observed.containers.insert(name.clone(), state);
        }
        Ok(observed)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, target: &Target) -> Result<()> {
        for name in &target.containers {
            container::start_container(&self.docker, name).await?;
            tracing::info!(container = %name, "container started");
        }
        Ok(())
    }

    async fn stop(&self, target: &Target, timeout_secs: i32) -> Result<()> {
        // Reverse start order so dependents stop before their dependencies.
        for name in target.containers.iter().rev() {
            container::stop_container(&self.docker, name, timeout_secs).await?;
            tracing::info!(container = %name, "container stopped");
        }
        Ok(())
    }

    async fn inspect(&self, target: &Target) -> Result<Observed> {
        self.observe(&target.containers).await
    }

    async fn pull(&self, deployment: &Deployment) -> Result<()> {
        let pulled = image::pull_missing(&self.docker, &deployment.images()).await?;
        if !pulled.is_empty() {
            tracing::info!(
                install = deployment.target.install_id,
                images = %pulled.join(", "),
                "pulled images"
            );
        }
        Ok(())
    }

    async fn recreate(&self, deployment: &Deployment, start: bool) -> Result<()> {
        let target = &deployment.target;
        for name in target.containers.iter().rev() {
            container::remove_container(&self.docker, name, true).await?;
        }

        let labels = resource_labels(&target.project, "network");
        network::ensure_network(&self.docker, &target.network, labels).await?;

        for svc in &deployment.services {
            for (volume_name, _) in &svc.volumes {
                let labels = resource_labels(&target.project, &svc.service);
                volume::ensure_volume(&self.docker, volume_name, labels).await?;
            }
            let id =
                container::create_container(&self.docker, &target.project, &target.network, svc)
                    .await?;
            if start {
                container::start_container(&self.docker, &id).await?;
                tracing::info!(container = %svc.container_name, image = %svc.image, "container started");
            }
        }
        Ok(())
    }

    async fn probe(
        &self,
        deployment: &Deployment,
        check: &HealthCheck,
        expect_running: bool,
    ) -> Result<()> {
        let names: Vec<String> = deployment
            .services
            .iter()
            .map(|s| s.container_name.clone())
            .collect();

        if !expect_running {
            let observed = self.observe(&names).await?;
            if let Some((name, _)) = observed
                .containers
                .iter()
                .find(|(_, s)| **s == ContainerState::Missing)
            {
                bail!("container {} does not exist", name);
            }
            return Ok(());
        }

        let timeout = probe_timeout(check, self.health_limit);
        let port = deployment.primary_host_port();
        health::wait_until(&deployment.target.project, timeout, || async {
            let observed = self.observe(&names).await?;
            if let Some((name, state)) = observed
                .containers
                .iter()
                .find(|(_, s)| **s != ContainerState::Running)
            {
                bail!("container {} is {:?}", name, state);
            }
            health::network_check(check, &self.probe_host, port).await
        })
        .await
    }

    async fn remove(&self, target: &Target, volumes: bool) -> Result<()> {
        for name in target.containers.iter().rev() {
            container::stop_container(&self.docker, name, 5).await?;
            container::remove_container(&self.docker, name, true).await?;
            tracing::info!(container = %name, "container removed");
        }
        if volumes {
            let removed = volume::remove_project_volumes(&self.docker, &target.project).await?;
            tracing::info!(install = target.install_id, volumes = removed, "volumes removed");
        }
        network::remove_network(&self.docker, &target.network).await?;
        Ok(())
    }
}
