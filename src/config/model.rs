use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::model::Protocol;

/// Contents of `appkeeper.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppkeeperConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub operations: OperationsSection,
    #[serde(default)]
    pub workers: WorkersSection,
    #[serde(default)]
    pub ports: PortsSection,
}

fn default_state_dir() -> String {
    ".appkeeper".to_string()
}

fn default_catalog() -> String {
    "catalog.toml".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Directory holding the install store, relative to the config file.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Template catalog, relative to the config file.
    #[serde(default = "default_catalog")]
    pub catalog: String,
    /// Address reported to clients in connection info.
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            catalog: default_catalog(),
            host: default_host(),
        }
    }
}

fn default_interval() -> String {
    "5m".to_string()
}

fn default_debounce() -> String {
    "30s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_debounce")]
    pub debounce: String,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            debounce: default_debounce(),
        }
    }
}

fn default_timeout() -> String {
    "10m".to_string()
}

fn default_stop_timeout_secs() -> i32 {
    10
}

fn default_health_timeout() -> String {
    "60s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationsSection {
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: i32,
    #[serde(default = "default_health_timeout")]
    pub health_timeout: String,
}

impl Default for OperationsSection {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            stop_timeout_secs: default_stop_timeout_secs(),
            health_timeout: default_health_timeout(),
        }
    }
}

fn default_max_operations() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersSection {
    #[serde(default = "default_max_operations")]
    pub max_operations: usize,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortsSection {
    /// Also refuse ports some unmanaged process already listens on.
    #[serde(default)]
    pub probe_host: bool,
    #[serde(default)]
    pub reserved: Vec<ReservedPort>,
}

/// A port held by something other than an install, such as the panel itself.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReservedPort {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    pub owner: String,
}

/// Parse a humantime duration, falling back when it is malformed.
/// Validation reports malformed values before this is reached.
fn duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

impl AppkeeperConfig {
    pub fn sync_interval(&self) -> Duration {
        duration_or(&self.sync.interval, Duration::from_secs(300))
    }

    pub fn sync_debounce(&self) -> Duration {
        duration_or(&self.sync.debounce, Duration::from_secs(30))
    }

    pub fn operation_timeout(&self) -> Duration {
        duration_or(&self.operations.timeout, Duration::from_secs(600))
    }

    pub fn health_timeout(&self) -> Duration {
        duration_or(&self.operations.health_timeout, Duration::from_secs(60))
    }
}

/// A parsed config plus the directory its relative paths resolve against.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AppkeeperConfig,
    pub path: PathBuf,
    pub base_dir: PathBuf,
}

impl LoadedConfig {
    pub fn new(config: AppkeeperConfig, path: &Path) -> Self {
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config,
            path: path.to_path_buf(),
            base_dir,
        }
    }

    /// Config with every default, rooted at `base_dir`.
    pub fn defaults(base_dir: &Path) -> Self {
        Self {
            config: AppkeeperConfig::default(),
            path: base_dir.join(super::resolve::CONFIG_FILE),
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.config.engine.state_dir)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.resolve(&self.config.engine.catalog)
    }
}
