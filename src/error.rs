use serde::Serialize;
use thiserror::Error;

use crate::engine::model::{Action, InstallId, InstallStatus, ResourceRef};
use crate::engine::ports::PortConflict;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Coarse error category, stable across message wording changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    HasDependents,
    InvalidTransition,
    RuntimeFailure,
    StoreFailure,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error(transparent)]
    PortConflict(#[from] PortConflict),

    #[error("an install named '{name}' already exists for app '{app_key}'")]
    NameTaken { app_key: String, name: String },

    #[error("install {install} is still used by: {}", join_refs(.resources))]
    HasDependents {
        install: InstallId,
        resources: Vec<ResourceRef>,
    },

    #[error("cannot {action} install {install} while it is {from}")]
    InvalidTransition {
        install: InstallId,
        from: InstallStatus,
        action: String,
    },

    #[error("container runtime failed: {detail}")]
    Runtime { detail: String },

    #[error("state store unavailable: {detail}")]
    Store { detail: String },
}

fn join_refs(resources: &[ResourceRef]) -> String {
    resources
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound { what: what.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Wrap a runtime capability error, keeping its whole context chain.
    pub fn runtime(err: anyhow::Error) -> Self {
        EngineError::Runtime {
            detail: format!("{err:#}"),
        }
    }

    /// Wrap a store error, keeping its whole context chain.
    pub fn store(err: anyhow::Error) -> Self {
        EngineError::Store {
            detail: format!("{err:#}"),
        }
    }

    pub fn invalid_transition(install: InstallId, from: InstallStatus, action: Action) -> Self {
        EngineError::InvalidTransition {
            install,
            from,
            action: action.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::PortConflict(_) | EngineError::NameTaken { .. } => ErrorKind::Conflict,
            EngineError::HasDependents { .. } => ErrorKind::HasDependents,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::Runtime { .. } => ErrorKind::RuntimeFailure,
            EngineError::Store { .. } => ErrorKind::StoreFailure,
        }
    }

    /// Stable machine-readable code for transport layers.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::HasDependents => "has_dependents",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::RuntimeFailure => "runtime_failure",
            ErrorKind::StoreFailure => "store_failure",
        }
    }

    /// HTTP-class status a transport layer would map this error to.
    pub fn status_hint(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::HasDependents | ErrorKind::InvalidTransition => 409,
            ErrorKind::RuntimeFailure => 500,
            ErrorKind::StoreFailure => 503,
        }
    }
}
