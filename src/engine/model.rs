use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type InstallId = u64;

/// Parameter values keyed by parameter name. Values are kept as JSON so
/// numbers, booleans and strings survive a round trip unchanged.
pub type Params = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// InstallStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Installing,
    Running,
    Stopped,
    Error,
    Upgrading,
    Deleting,
    Deleted,
}

impl InstallStatus {
    /// Statuses that describe an operation still in progress.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            InstallStatus::Installing | InstallStatus::Upgrading | InstallStatus::Deleting
        )
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallStatus::Installing => "installing",
            InstallStatus::Running => "running",
            InstallStatus::Stopped => "stopped",
            InstallStatus::Error => "error",
            InstallStatus::Upgrading => "upgrading",
            InstallStatus::Deleting => "deleting",
            InstallStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Stop,
    Restart,
    Upgrade,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Upgrade => "upgrade",
        };
        f.write_str(s)
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "restart" => Ok(Action::Restart),
            "upgrade" => Ok(Action::Upgrade),
            other => Err(format!(
                "unknown action '{other}' (expected start, stop, restart or upgrade)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

/// A host port published for one service of an install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub service: String,
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    /// Parameter that mirrors the host port in the rendered config, if any.
    #[serde(default)]
    pub param: Option<String>,
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub container_name: String,
}

// ---------------------------------------------------------------------------
// Error reasons and pending upgrades
// ---------------------------------------------------------------------------

/// Why an install is in the `Error` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorReason {
    RuntimeFailure { detail: String },
    ServicesMissing,
    Degraded { running: usize, total: usize },
    /// The upgrade failed after containers may already have been recreated on
    /// the new image. The version field still names the old version, so an
    /// operator has to decide whether to retry or roll back by hand.
    UpgradeFailed { attempted_version: String, detail: String },
    Interrupted { during: String },
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::RuntimeFailure { detail } => write!(f, "runtime failure: {detail}"),
            ErrorReason::ServicesMissing => f.write_str("containers missing"),
            ErrorReason::Degraded { running, total } => {
                write!(f, "degraded: {running}/{total} containers running")
            }
            ErrorReason::UpgradeFailed {
                attempted_version,
                detail,
            } => write!(
                f,
                "upgrade to {attempted_version} failed (containers may run the new image): {detail}"
            ),
            ErrorReason::Interrupted { during } => write!(f, "interrupted during {during}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpgrade {
    pub from_version: String,
    pub to_version: String,
    /// Status to return to when the upgrade succeeds.
    pub resume: InstallStatus,
}

// ---------------------------------------------------------------------------
// Install
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Install {
    pub id: InstallId,
    pub app_key: String,
    pub version: String,
    pub name: String,
    pub status: InstallStatus,
    pub services: Vec<ServiceRecord>,
    pub ports: Vec<PortBinding>,
    pub params: Params,
    pub rendered_config: String,
    pub default_config: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ignored_versions: BTreeSet<String>,
    #[serde(default)]
    pub error_reason: Option<ErrorReason>,
    #[serde(default)]
    pub pending_upgrade: Option<PendingUpgrade>,
    /// The containers were built from older parameters and must be
    /// recreated before the new values take effect.
    #[serde(default)]
    pub redeploy_pending: bool,
}

impl Install {
    /// The first published port in service order.
    pub fn primary_port(&self) -> Option<&PortBinding> {
        self.ports.first()
    }

    pub fn port_for(&self, service: &str) -> Option<&PortBinding> {
        self.ports.iter().find(|p| p.service == service)
    }

    pub fn primary_service(&self) -> Option<&ServiceRecord> {
        self.services.first()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.services
            .iter()
            .map(|s| s.container_name.clone())
            .collect()
    }

    /// Move to `status`, clearing or setting the error reason to match.
    pub fn set_status(&mut self, status: InstallStatus, reason: Option<ErrorReason>) {
        self.status = status;
        self.error_reason = if status == InstallStatus::Error {
            reason
        } else {
            None
        };
        self.updated_at = Utc::now();
    }

    pub fn summary(&self) -> InstalledSummary {
        InstalledSummary {
            id: self.id,
            name: self.name.clone(),
            app_key: self.app_key.clone(),
            version: self.version.clone(),
            status: self.status,
            ports: self.ports.clone(),
            error_reason: self.error_reason.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn label(&self) -> InstallLabel {
        InstallLabel {
            id: self.id,
            app_key: self.app_key.clone(),
            name: self.name.clone(),
        }
    }
}

/// Lightweight projection of an install for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledSummary {
    pub id: InstallId,
    pub name: String,
    pub app_key: String,
    pub version: String,
    pub status: InstallStatus,
    pub ports: Vec<PortBinding>,
    pub error_reason: Option<ErrorReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Human-facing identity of an install, used by audit collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallLabel {
    pub id: InstallId,
    pub app_key: String,
    pub name: String,
}

impl fmt::Display for InstallLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.app_key, self.name)
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Website,
    Proxy,
    Database,
    Backup,
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Website => f.write_str("website"),
            ResourceKind::Proxy => f.write_str("proxy"),
            ResourceKind::Database => f.write_str("database"),
            ResourceKind::Backup => f.write_str("backup"),
            ResourceKind::Other(kind) => f.write_str(kind),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err("resource kind must not be empty".to_string()),
            "website" => Ok(ResourceKind::Website),
            "proxy" => Ok(ResourceKind::Proxy),
            "database" => Ok(ResourceKind::Database),
            "backup" => Ok(ResourceKind::Backup),
            other => Ok(ResourceKind::Other(other.to_string())),
        }
    }
}

/// Reference to an external resource that depends on an install.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} '{}' ({})", self.kind, name, self.id),
            None => write!(f, "{} {}", self.kind, self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub resource: ResourceRef,
    pub install_id: InstallId,
}
