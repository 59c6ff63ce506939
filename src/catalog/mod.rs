pub mod graph;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::engine::model::Protocol;
use crate::error::EngineError;

use graph::ServiceGraph;

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    apps: BTreeMap<String, AppTemplate>,
}

/// Template catalog: every app that can be installed, keyed by app key.
#[derive(Debug, Default)]
pub struct Catalog {
    apps: BTreeMap<String, AppTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppTemplate {
    /// Filled from the table key when the catalog is loaded.
    #[serde(skip)]
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    pub services: BTreeMap<String, ServiceTemplate>,
    #[serde(default)]
    pub params: Vec<ParamField>,
    #[serde(default)]
    pub config_template: String,
    #[serde(default)]
    pub health: HealthCheck,
    #[serde(default)]
    pub credentials: Option<CredentialKeys>,
    #[serde(default)]
    pub versions: Vec<TemplateVersion>,
    /// Service names in start order, dependencies first.
    #[serde(skip)]
    pub start_order: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceTemplate {
    /// Image reference; may contain `{{ version }}` and parameter placeholders.
    pub image: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicePort {
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    /// Parameter holding the published host port. Without one the host port
    /// equals the container port.
    #[serde(default)]
    pub param: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Number,
    Password,
    Port,
    Select,
    Bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamField {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub editable: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Parameter keys that hold connection credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialKeys {
    #[serde(default)]
    pub username: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum HealthCheck {
    /// Every container reports running (or exists, for stopped installs).
    #[serde(rename = "running")]
    Running {
        #[serde(default)]
        timeout: Option<u64>,
    },
    #[serde(rename = "tcp")]
    Tcp {
        #[serde(default)]
        timeout: Option<u64>,
    },
    #[serde(rename = "http")]
    Http {
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default)]
        timeout: Option<u64>,
    },
}

fn default_http_path() -> String {
    "/".to_string()
}

impl Default for HealthCheck {
    fn default() -> Self {
        HealthCheck::Running { timeout: None }
    }
}

impl HealthCheck {
    /// Get the configured timeout or return the default for this check type.
    pub fn timeout_secs(&self) -> Option<u64> {
        match self {
            HealthCheck::Running { timeout } => *timeout,
            HealthCheck::Tcp { timeout } => *timeout,
            HealthCheck::Http { timeout, .. } => *timeout,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateVersion {
    pub version: String,
    /// Oldest version that may upgrade straight to this one.
    #[serde(default)]
    pub min_upgrade_from: Option<String>,
}

/// Read-only description of one service of a template.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub image: String,
    pub ports: Vec<u16>,
}

impl AppTemplate {
    pub fn has_version(&self, version: &str) -> bool {
        self.version(version).is_some()
    }

    pub fn version(&self, version: &str) -> Option<&TemplateVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn field(&self, key: &str) -> Option<&ParamField> {
        self.params.iter().find(|f| f.key == key)
    }

    /// Services in start order.
    pub fn ordered_services(&self) -> impl Iterator<Item = (&String, &ServiceTemplate)> {
        self.start_order
            .iter()
            .filter_map(|name| self.services.get_key_value(name))
    }

    pub fn service_infos(&self) -> Vec<ServiceInfo> {
        self.ordered_services()
            .map(|(name, svc)| ServiceInfo {
                name: name.clone(),
                image: svc.image.clone(),
                ports: svc.ports.iter().map(|p| p.container_port).collect(),
            })
            .collect()
    }
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("loading catalog {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content).context("parsing catalog")?;
        let mut apps = BTreeMap::new();
        for (key, mut template) in file.apps {
            if template.services.is_empty() {
                anyhow::bail!("app '{}' declares no services", key);
            }
            let graph = ServiceGraph::from_template(&template)
                .map_err(|e| anyhow::anyhow!("app '{}': {}", key, e))?;
            template.start_order = graph
                .start_order()
                .map_err(|e| anyhow::anyhow!("app '{}': {}", key, e))?;
            template.key = key.clone();
            apps.insert(key, template);
        }
        Ok(Self { apps })
    }

    pub fn get(&self, key: &str) -> Option<&AppTemplate> {
        self.apps.get(key)
    }

    /// Like [`Catalog::get`] but reports a missing template as `NotFound`.
    pub fn template(&self, key: &str) -> Result<&AppTemplate, EngineError> {
        self.get(key)
            .ok_or_else(|| EngineError::not_found(format!("app template '{key}'")))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.apps.keys()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
