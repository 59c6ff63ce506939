pub mod docker;
pub mod health;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::catalog::HealthCheck;
use crate::engine::model::{Install, InstallId, Protocol};

/// Port mapping: (container_port, host_port, protocol).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMap {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: Protocol,
}

/// The containers of one install, in start order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub install_id: InstallId,
    /// Label value shared by every resource of the install.
    pub project: String,
    pub network: String,
    pub containers: Vec<String>,
}

impl Target {
    pub fn for_install(install: &Install) -> Self {
        Self {
            install_id: install.id,
            project: project_label(install.id),
            network: network_name(install.id),
            containers: install.container_names(),
        }
    }
}

pub fn project_label(install: InstallId) -> String {
    format!("appkeeper-{install}")
}

pub fn network_name(install: InstallId) -> String {
    format!("appkeeper-{install}-net")
}

/// Everything needed to (re)create the containers of an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub target: Target,
    pub services: Vec<ServiceDeployment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDeployment {
    pub service: String,
    pub container_name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub ports: Vec<PortMap>,
    /// (volume name, container path)
    pub volumes: Vec<(String, String)>,
}

impl Deployment {
    pub fn images(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.image.as_str()).collect()
    }

    /// First published host port, used by network health checks.
    pub fn primary_host_port(&self) -> Option<u16> {
        self.services
            .iter()
            .flat_map(|s| s.ports.iter())
            .map(|p| p.host_port)
            .next()
    }
}

/// Observed state of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Stopped,
    Missing,
}

/// What the runtime reports for an install's containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Observed {
    pub containers: BTreeMap<String, ContainerState>,
}

/// Aggregate liveness of an install's containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Stopped,
    Missing,
    Degraded { running: usize, total: usize },
}

impl Observed {
    pub fn liveness(&self) -> Liveness {
        let total = self.containers.len();
        let count = |state: ContainerState| {
            self.containers.values().filter(|s| **s == state).count()
        };
        let running = count(ContainerState::Running);
        let missing = count(ContainerState::Missing);
        if total == 0 || missing == total {
            Liveness::Missing
        } else if running == total {
            Liveness::Running
        } else if running == 0 && missing == 0 {
            Liveness::Stopped
        } else {
            Liveness::Degraded { running, total }
        }
    }
}

/// Narrow capability interface over the container runtime.
///
/// Implementations return `anyhow` errors with context; the engine decides
/// how a failure affects install status.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, target: &Target) -> Result<()>;

    async fn stop(&self, target: &Target, timeout_secs: i32) -> Result<()>;

    async fn inspect(&self, target: &Target) -> Result<Observed>;

    /// Pull every image of the deployment that is not present locally.
    async fn pull(&self, deployment: &Deployment) -> Result<()>;

    /// Replace the containers with ones built from `deployment`, starting them
    /// when `start` is set.
    async fn recreate(&self, deployment: &Deployment, start: bool) -> Result<()>;

    /// Change the published ports. Containers cannot rebind ports in place,
    /// so the default recreates them.
    async fn remap_ports(&self, deployment: &Deployment, start: bool) -> Result<()> {
        self.recreate(deployment, start).await
    }

    /// Check the deployment is healthy. Stopped installs only need their
    /// containers to exist.
    async fn probe(
        &self,
        deployment: &Deployment,
        check: &HealthCheck,
        expect_running: bool,
    ) -> Result<()>;

    /// Remove containers, network and (optionally) volumes.
    async fn remove(&self, target: &Target, volumes: bool) -> Result<()>;
}
