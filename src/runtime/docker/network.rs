use anyhow::{Context, Result};
use bollard::models::NetworkCreateRequest;
use bollard::Docker;
use std::collections::HashMap;

use super::{gone_is_ok, is_not_found};

/// Services of one install share a private bridge network so they can reach
/// each other by service name. Reused when it already exists.
pub async fn ensure_network(
    docker: &Docker,
    name: &str,
    labels: HashMap<String, String>,
) -> Result<()> {
    match docker.inspect_network(name, None).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => {
            docker
                .create_network(NetworkCreateRequest {
                    name: name.to_string(),
                    driver: Some("bridge".to_string()),
                    labels: Some(labels),
                    ..Default::default()
                })
                .await
                .with_context(|| format!("creating network {name}"))?;
            tracing::debug!(network = %name, "network created");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("inspecting network {name}")),
    }
}

pub async fn remove_network(docker: &Docker, name: &str) -> Result<()> {
    gone_is_ok(docker.remove_network(name).await, || {
        format!("removing network {name}")
    })
}

/// Labels stamped on every Docker resource owned by an install.
pub fn resource_labels(project: &str, service: &str) -> HashMap<String, String> {
    HashMap::from([
        ("appkeeper.install".to_string(), project.to_string()),
        ("appkeeper.service".to_string(), service.to_string()),
        ("appkeeper.managed-by".to_string(), "appkeeper".to_string()),
    ])
}

/// Label filter selecting every resource of an install.
pub fn project_filter(project: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "label".to_string(),
        vec![format!("appkeeper.install={}", project)],
    )])
}
