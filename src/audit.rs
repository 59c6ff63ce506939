use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::engine::model::InstallLabel;

/// One mutating operation, with enough before/after state for an audit
/// collaborator to write a human-readable entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub actor: String,
    pub action: String,
    pub target: Option<InstallLabel>,
    pub before: BTreeMap<String, String>,
    pub after: BTreeMap<String, String>,
    pub succeeded: bool,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(actor: &str, action: impl Into<String>, target: Option<InstallLabel>) -> Self {
        Self {
            actor: actor.to_string(),
            action: action.into(),
            target,
            before: BTreeMap::new(),
            after: BTreeMap::new(),
            succeeded: true,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn before(mut self, key: &str, value: impl ToString) -> Self {
        self.before.insert(key.to_string(), value.to_string());
        self
    }

    pub fn after(mut self, key: &str, value: impl ToString) -> Self {
        self.after.insert(key.to_string(), value.to_string());
        self
    }

    /// Mark the record with the outcome of the operation.
    pub fn outcome<T, E: std::fmt::Display>(mut self, result: &Result<T, E>) -> Self {
        if let Err(e) = result {
            self.succeeded = false;
            self.detail = Some(e.to_string());
        }
        self
    }
}

/// Receiver for audit records. Formatting and storage are up to the
/// implementation.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Emits audit records as `tracing` events under the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        let target = record
            .target
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_default();
        let before = serde_json::to_string(&record.before).unwrap_or_default();
        let after = serde_json::to_string(&record.after).unwrap_or_default();
        if record.succeeded {
            tracing::info!(
                target: "audit",
                actor = %record.actor,
                action = %record.action,
                install = %target,
                before = %before,
                after = %after,
                "audit"
            );
        } else {
            tracing::warn!(
                target: "audit",
                actor = %record.actor,
                action = %record.action,
                install = %target,
                before = %before,
                after = %after,
                error = record.detail.as_deref().unwrap_or_default(),
                "audit (failed)"
            );
        }
    }
}

/// Keeps every record in memory. Handy for tests and for callers that forward
/// records in batches.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: std::sync::Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(record);
    }
}
