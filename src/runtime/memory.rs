use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::catalog::HealthCheck;
use crate::engine::model::InstallId;
use crate::runtime::{
    ContainerRuntime, ContainerState, Deployment, Observed, PortMap, ServiceDeployment, Target,
};

/// Runtime capability a test can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailPoint {
    Start,
    Stop,
    Inspect,
    Pull,
    Recreate,
    Probe,
    Remove,
}

/// A call made against the runtime, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Start(InstallId),
    Stop(InstallId),
    Inspect(InstallId),
    Pull(InstallId),
    Recreate(InstallId),
    Probe(InstallId),
    Remove(InstallId),
}

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub image: String,
    pub running: bool,
    pub ports: Vec<PortMap>,
    pub env: BTreeMap<String, String>,
}

impl MemoryContainer {
    fn from_service(svc: &ServiceDeployment, running: bool) -> Self {
        Self {
            image: svc.image.clone(),
            running,
            ports: svc.ports.clone(),
            env: svc.env.iter().cloned().collect(),
        }
    }
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, MemoryContainer>,
    calls: Vec<RuntimeCall>,
    failures: BTreeSet<FailPoint>,
    delay: Option<Duration>,
}

/// Container runtime that keeps containers in memory.
///
/// Used for dry runs and by the engine's tests, which seed containers, inject
/// failures and inspect the calls the engine made.
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.state().failures.insert(point);
    }

    pub fn clear_failure(&self, point: FailPoint) {
        self.state().failures.remove(&point);
    }

    /// Make inspect, pull, recreate and remove take this long, to exercise
    /// timeouts and overlapping sweeps.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Create the containers of a deployment as if an installer had run.
    pub fn seed(&self, deployment: &Deployment, running: bool) {
        let mut state = self.state();
        for svc in &deployment.services {
            state
                .containers
                .insert(svc.container_name.clone(), MemoryContainer::from_service(svc, running));
        }
    }

    /// Remove a container behind the engine's back.
    pub fn drop_container(&self, name: &str) {
        self.state().containers.remove(name);
    }

    /// Flip a container's running flag behind the engine's back.
    pub fn set_running(&self, name: &str, running: bool) {
        if let Some(c) = self.state().containers.get_mut(name) {
            c.running = running;
        }
    }

    pub fn container(&self, name: &str) -> Option<MemoryContainer> {
        self.state().containers.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    fn enter(&self, call: RuntimeCall, point: FailPoint) -> Result<Option<Duration>> {
        let mut state = self.state();
        state.calls.push(call);
        if state.failures.contains(&point) {
            bail!("injected {:?} failure", point);
        }
        Ok(state.delay)
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn start(&self, target: &Target) -> Result<()> {
        self.enter(RuntimeCall::Start(target.install_id), FailPoint::Start)?;
        let mut state = self.state();
        for name in &target.containers {
            match state.containers.get_mut(name) {
                Some(c) => c.running = true,
                None => bail!("starting container {}: no such container", name),
            }
        }
        Ok(())
    }

    async fn stop(&self, target: &Target, _timeout_secs: i32) -> Result<()> {
        self.enter(RuntimeCall::Stop(target.install_id), FailPoint::Stop)?;
        let mut state = self.state();
        for name in &target.containers {
            if let Some(c) = state.containers.get_mut(name) {
                c.running = false;
            }
        }
        Ok(())
    }

    async fn inspect(&self, target: &Target) -> Result<Observed> {
        let delay = self.enter(RuntimeCall::Inspect(target.install_id), FailPoint::Inspect)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        let containers = target
            .containers
            .iter()
            .map(|name| {
                let observed = match state.containers.get(name) {
                    Some(c) if c.running => ContainerState::Running,
                    Some(_) => ContainerState::Stopped,
                    None => ContainerState::Missing,
                };
                (name.clone(), observed)
            })
            .collect();
        Ok(Observed { containers })
    }

    async fn pull(&self, deployment: &Deployment) -> Result<()> {
        let delay = self.enter(RuntimeCall::Pull(deployment.target.install_id), FailPoint::Pull)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn recreate(&self, deployment: &Deployment, start: bool) -> Result<()> {
        let delay = self.enter(
            RuntimeCall::Recreate(deployment.target.install_id),
            FailPoint::Recreate,
        )?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        for name in &deployment.target.containers {
            state.containers.remove(name);
        }
        for svc in &deployment.services {
            state
                .containers
                .insert(svc.container_name.clone(), MemoryContainer::from_service(svc, start));
        }
        Ok(())
    }

    async fn probe(
        &self,
        deployment: &Deployment,
        _check: &HealthCheck,
        expect_running: bool,
    ) -> Result<()> {
        self.enter(RuntimeCall::Probe(deployment.target.install_id), FailPoint::Probe)?;
        let state = self.state();
        for svc in &deployment.services {
            match state.containers.get(&svc.container_name) {
                Some(c) if c.running || !expect_running => {}
                Some(_) => bail!("container {} is not running", svc.container_name),
                None => bail!("container {} does not exist", svc.container_name),
            }
        }
        Ok(())
    }

    async fn remove(&self, target: &Target, _volumes: bool) -> Result<()> {
        let delay = self.enter(RuntimeCall::Remove(target.install_id), FailPoint::Remove)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        for name in &target.containers {
            state.containers.remove(name);
        }
        Ok(())
    }
}
