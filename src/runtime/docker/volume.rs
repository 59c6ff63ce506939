use anyhow::{Context, Result};
use bollard::models::VolumeCreateRequest;
use bollard::query_parameters::{ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use std::collections::HashMap;

use super::network::project_filter;
use super::{gone_is_ok, is_not_found};

/// Make sure a named data volume exists. Existing volumes are reused as-is,
/// so data survives container recreation across upgrades and port changes.
/// Returns `true` when the volume had to be created.
pub async fn ensure_volume(
    docker: &Docker,
    name: &str,
    labels: HashMap<String, String>,
) -> Result<bool> {
    match docker.inspect_volume(name).await {
        Ok(_) => Ok(false),
        Err(e) if is_not_found(&e) => {
            docker
                .create_volume(VolumeCreateRequest {
                    name: Some(name.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                })
                .await
                .with_context(|| format!("creating volume {name}"))?;
            tracing::debug!(volume = %name, "volume created");
            Ok(true)
        }
        Err(e) => Err(e).with_context(|| format!("inspecting volume {name}")),
    }
}

/// Delete every data volume of an install. Returns how many were removed.
pub async fn remove_project_volumes(docker: &Docker, project: &str) -> Result<usize> {
    let volumes = docker
        .list_volumes(Some(ListVolumesOptions {
            filters: Some(project_filter(project)),
        }))
        .await
        .with_context(|| format!("listing volumes of {project}"))?
        .volumes
        .unwrap_or_default();

    for volume in &volumes {
        gone_is_ok(
            docker
                .remove_volume(&volume.name, Some(RemoveVolumeOptions { force: false }))
                .await,
            || format!("removing volume {}", volume.name),
        )?;
        tracing::debug!(volume = %volume.name, "volume removed");
    }
    Ok(volumes.len())
}
