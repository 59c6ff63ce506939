pub mod model;
pub mod resolve;
pub mod validate;

use anyhow::Context;
use std::path::Path;

use model::{AppkeeperConfig, LoadedConfig};

/// Read and parse a config file, returning it with its raw source so
/// validation can point into it.
pub fn load_config(path: &Path) -> anyhow::Result<(LoadedConfig, String)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AppkeeperConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok((LoadedConfig::new(config, path), content))
}
