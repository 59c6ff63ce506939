use anyhow::{bail, Context, Result};
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;

use crate::catalog::HealthCheck;

/// Default bound for a health probe when the template sets none.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry `check` with exponential backoff until it succeeds or `timeout`
/// elapses.
pub async fn wait_until<F, Fut>(name: &str, timeout: Duration, check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let result = tokio::time::timeout(
        timeout,
        check
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(250))
                    .with_max_delay(Duration::from_secs(3))
                    .with_max_times(200)
                    .with_jitter(),
            )
            .notify(|err: &anyhow::Error, dur: Duration| {
                tracing::debug!(
                    install = %name,
                    "health check failed: {:#}, retrying in {:?}",
                    err,
                    dur
                );
            }),
    )
    .await;

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => bail!("health check for '{}' timed out after {:?}", name, timeout),
    }
}

/// Timeout for a check: the template's own, capped by the engine's limit.
pub fn probe_timeout(check: &HealthCheck, limit: Duration) -> Duration {
    check
        .timeout_secs()
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT)
        .min(limit)
}

/// Single TCP connect attempt.
pub async fn tcp_check(host: &str, port: u16) -> Result<()> {
    tokio::time::timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect((host, port)),
    )
    .await
    .context("TCP connect timed out")?
    .with_context(|| format!("TCP connect to {}:{} failed", host, port))?;
    Ok(())
}

/// Single HTTP GET; any 2xx or 3xx counts as healthy.
pub async fn http_check(host: &str, port: u16, path: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("building HTTP client")?;
    let path = path.strip_prefix('/').unwrap_or(path);
    let url = format!("http://{}:{}/{}", host, port, path);
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("HTTP health check {}", url))?;
    let status = response.status();
    if !(status.is_success() || status.is_redirection()) {
        bail!("HTTP health check {} returned status {}", url, status);
    }
    Ok(())
}

/// Network-level part of a health check. `Running` checks have none.
pub async fn network_check(check: &HealthCheck, host: &str, port: Option<u16>) -> Result<()> {
    match check {
        HealthCheck::Running { .. } => Ok(()),
        HealthCheck::Tcp { .. } => {
            let port = port.context("TCP health check requires a published port")?;
            tcp_check(host, port).await
        }
        HealthCheck::Http { path, .. } => {
            let port = port.context("HTTP health check requires a published port")?;
            http_check(host, port, path).await
        }
    }
}
