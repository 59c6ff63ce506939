use anyhow::{Context, Result};
use bollard::models::{
    ContainerCreateBody, EndpointSettings, HostConfig, NetworkingConfig, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use std::collections::HashMap;

use super::network::resource_labels;
use super::{gone_is_ok, is_not_found};
use crate::runtime::{ContainerState, ServiceDeployment};

/// Docker answers 304 when a container is already in the requested state.
fn unchanged_is_ok(
    result: std::result::Result<(), bollard::errors::Error>,
    what: impl FnOnce() -> String,
) -> Result<()> {
    match result {
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        }) => Ok(()),
        other => gone_is_ok(other, what),
    }
}

/// Create body for one service. Ports publish on every interface, named
/// volumes mount by name, and the service name is a DNS alias on the
/// install's network.
pub fn container_spec(project: &str, network: &str, svc: &ServiceDeployment) -> ContainerCreateBody {
    let mut port_bindings = HashMap::new();
    let mut exposed_ports = Vec::new();
    for pm in &svc.ports {
        let key = format!("{}/{}", pm.container_port, pm.protocol);
        port_bindings.insert(
            key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(pm.host_port.to_string()),
            }]),
        );
        exposed_ports.push(key);
    }

    let endpoint = EndpointSettings {
        aliases: Some(vec![svc.service.clone()]),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(svc.image.clone()),
        env: Some(svc.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        exposed_ports: Some(exposed_ports),
        labels: Some(resource_labels(project, &svc.service)),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(
                svc.volumes
                    .iter()
                    .map(|(volume, path)| format!("{volume}:{path}"))
                    .collect(),
            ),
            network_mode: Some(network.to_string()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        }),
        networking_config: Some(NetworkingConfig {
            endpoints_config: Some(HashMap::from([(network.to_string(), endpoint)])),
        }),
        ..Default::default()
    }
}

/// Create the container for one service, replacing any container with the
/// same name. Returns the new container's id.
pub async fn create_container(
    docker: &Docker,
    project: &str,
    network: &str,
    svc: &ServiceDeployment,
) -> Result<String> {
    remove_container(docker, &svc.container_name, true).await?;

    let options = CreateContainerOptions {
        name: Some(svc.container_name.clone()),
        ..Default::default()
    };
    let response = docker
        .create_container(Some(options), container_spec(project, network, svc))
        .await
        .with_context(|| format!("creating container {}", svc.container_name))?;
    tracing::debug!(container = %svc.container_name, id = %response.id, "container created");
    Ok(response.id)
}

pub async fn start_container(docker: &Docker, container: &str) -> Result<()> {
    let result = docker
        .start_container(container, None::<StartContainerOptions>)
        .await;
    // A missing container cannot be started, so 404 is an error here.
    if let Err(e) = &result {
        if is_not_found(e) {
            anyhow::bail!("container {container} does not exist");
        }
    }
    unchanged_is_ok(result, || format!("starting container {container}"))
}

/// Stop with a grace period before Docker kills the container.
pub async fn stop_container(docker: &Docker, container: &str, timeout_secs: i32) -> Result<()> {
    let options = StopContainerOptions {
        t: Some(timeout_secs),
        signal: None,
    };
    unchanged_is_ok(docker.stop_container(container, Some(options)).await, || {
        format!("stopping container {container}")
    })
}

pub async fn remove_container(docker: &Docker, container: &str, force: bool) -> Result<()> {
    let options = RemoveContainerOptions {
        force,
        ..Default::default()
    };
    gone_is_ok(docker.remove_container(container, Some(options)).await, || {
        format!("removing container {container}")
    })
}

pub async fn container_state(docker: &Docker, container: &str) -> Result<ContainerState> {
    match docker
        .inspect_container(container, None::<InspectContainerOptions>)
        .await
    {
        Ok(info) => Ok(match info.state.and_then(|s| s.running) {
            Some(true) => ContainerState::Running,
            _ => ContainerState::Stopped,
        }),
        Err(e) if is_not_found(&e) => Ok(ContainerState::Missing),
        Err(e) => Err(e).with_context(|| format!("inspecting container {container}")),
    }
}
