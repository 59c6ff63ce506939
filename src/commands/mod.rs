pub mod daemon;
pub mod manage;
pub mod query;
pub mod validate;

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::audit::TracingAuditSink;
use crate::catalog::Catalog;
use crate::config;
use crate::config::model::LoadedConfig;
use crate::config::resolve::resolve_config;
use crate::engine::model::Params;
use crate::engine::{Engine, EngineSettings};
use crate::runtime::docker::DockerRuntime;
use crate::store::JsonFileStore;

/// Find and load the config, falling back to defaults rooted at the current
/// directory when there is none. An invalid config is reported and refused.
pub fn load(config_file: Option<&Path>) -> Result<LoadedConfig> {
    let Some(path) = resolve_config(config_file)? else {
        let cwd = std::env::current_dir().context("reading current directory")?;
        return Ok(LoadedConfig::defaults(&cwd));
    };
    let (loaded, source) = config::load_config(&path)?;
    let filename = validate::display_name(&path);
    if let Err(errors) = config::validate::validate(&loaded.config, &source, &filename) {
        let count = errors.len();
        validate::report(errors);
        bail!("{} has {} problem(s); run `appkeeper validate` for details", filename, count);
    }
    Ok(loaded)
}

/// Open the engine against the local Docker daemon. Read-only commands skip
/// the daemon check since they never reach the runtime.
pub async fn open_engine(config_file: Option<&Path>, needs_runtime: bool) -> Result<Engine> {
    let loaded = load(config_file)?;
    let settings = EngineSettings::from_config(&loaded.config);

    let catalog_path = loaded.catalog_path();
    let catalog = Catalog::load(&catalog_path)?;
    tracing::debug!(apps = catalog.len(), path = %catalog_path.display(), "catalog loaded");

    let runtime = if needs_runtime {
        DockerRuntime::connect(settings.host.clone(), settings.timeouts.health).await?
    } else {
        DockerRuntime::new(settings.host.clone(), settings.timeouts.health)?
    };
    let store = JsonFileStore::new(loaded.state_dir());

    let engine = Engine::open(
        settings,
        Arc::new(catalog),
        Arc::new(store),
        Arc::new(runtime),
        Arc::new(TracingAuditSink),
    )?;
    Ok(engine)
}

/// Turn `KEY=VALUE` pairs into parameters. Values that parse as JSON keep
/// their type; anything else is a string.
pub fn params_from_pairs(pairs: Vec<(String, String)>) -> Params {
    pairs
        .into_iter()
        .map(|(k, v)| {
            let value = serde_json::from_str(&v).unwrap_or(serde_json::Value::String(v));
            (k, value)
        })
        .collect()
}
