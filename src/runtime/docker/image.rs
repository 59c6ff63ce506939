use anyhow::{bail, Context, Result};
use backon::{ExponentialBuilder, Retryable};
use bollard::query_parameters::CreateImageOptions;
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use std::time::Duration;

/// Split an image reference into the `from_image` and `tag` a pull needs.
///
/// `mariadb:11` pulls tag `11`, a bare `redis` pulls `latest`, and a registry
/// port (`registry:5000/app`) is not mistaken for a tag. Digest references
/// (`redis@sha256:...`) are pulled as-is without a tag.
pub fn pull_args(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    match image.rsplit_once(':') {
        Some((repo, tag)) if !repo.is_empty() && !tag.is_empty() && !tag.contains('/') => {
            (repo, Some(tag))
        }
        _ => (image, Some("latest")),
    }
}

async fn pull_once(docker: &Docker, image: &str) -> Result<()> {
    let (repo, tag) = pull_args(image);
    let options = CreateImageOptions {
        from_image: Some(repo.to_string()),
        tag: tag.map(str::to_string),
        ..Default::default()
    };
    let mut progress = docker.create_image(Some(options), None, None);
    while let Some(info) = progress.try_next().await? {
        if let Some(detail) = info.error_detail {
            bail!(
                "{}",
                detail.message.unwrap_or_else(|| "unknown pull error".to_string())
            );
        }
    }
    Ok(())
}

/// Pull one image, retrying a few times so a flaky registry does not fail an
/// upgrade outright.
pub async fn pull_image(docker: &Docker, image: &str) -> Result<()> {
    (|| pull_once(docker, image))
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(10))
                .with_max_times(3),
        )
        .notify(|err: &anyhow::Error, dur: Duration| {
            tracing::warn!(image = %image, "pull failed: {:#}, retrying in {:?}", err, dur);
        })
        .await
        .with_context(|| format!("pulling image {image}"))
}

/// Pull the images that are not present locally, concurrently. Returns the
/// images that were actually pulled.
pub async fn pull_missing(docker: &Docker, images: &[&str]) -> Result<Vec<String>> {
    let pulls = images.iter().map(|&image| async move {
        if docker.inspect_image(image).await.is_ok() {
            tracing::debug!(image = %image, "image present locally");
            return Ok(None);
        }
        pull_image(docker, image).await.map(|()| Some(image.to_string()))
    }).collect::<Vec<_>>();
    let results: Vec<Result<Option<String>>> =
        futures_util::stream::iter(pulls).buffer_unordered(4).collect().await;

    let mut pulled = Vec::new();
    for result in results {
        if let Some(image) = result? {
            pulled.push(image);
        }
    }
    Ok(pulled)
}
