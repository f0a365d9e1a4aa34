//! Audit logger.
//!
//! Every mutation made through a [`UnitOfWork`](crate::context::UnitOfWork) produces
//! exactly one [`AuditRecord`] attributed to the bound tenant and actor. Business code
//! never writes audit rows itself.
//!
//! Writes are best-effort with respect to the mutation they describe: a failure is
//! counted in [`AuditMetrics`], logged on the `tenancy::audit` target, and swallowed.

pub mod entity;
mod query;
mod scope;
mod snapshot;
mod writer;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenancy_security::{ActorId, TenantId};

use crate::secure::IsolationStore;

pub use entity::{AuditAction, Model as AuditEntry};
pub use query::{AuditFilter, AuditPage, DateRange, ExportFormat, Page};
pub(crate) use scope::AuditScope;
pub use snapshot::REDACTED;

pub(crate) use query::{export_report, list_entries};

/// Log target for audit write failures.
pub const AUDIT_TARGET: &str = "tenancy::audit";

/// Only the first failure and every `FAILURE_LOG_EVERY`-th after it are logged.
const FAILURE_LOG_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditMode {
    /// Written in the unit of work's own transaction, under a savepoint.
    #[default]
    Inline,
    /// Buffered per unit of work, handed to a single writer task after commit.
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuditConfig {
    pub mode: AuditMode,
    /// Entities (table names) whose reads are audited too.
    pub sensitive_entities: Vec<String>,
    /// Case-insensitive field-name fragments masked in snapshots.
    pub redacted_fields: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            mode: AuditMode::Inline,
            sensitive_entities: Vec::new(),
            redacted_fields: ["password", "secret", "token", "api_key", "credential"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }
}

/// One audit entry before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    pub entity_type: String,
    pub entity_id: String,
    pub action: AuditAction,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

/// A failed audit write. Never returned to callers; only logged and counted.
#[derive(Debug, thiserror::Error)]
#[error("audit write for {action:?} on {entity_type}/{entity_id} failed: {source}")]
pub struct AuditWriteFailure {
    pub entity_type: String,
    pub entity_id: String,
    pub action: AuditAction,
    #[source]
    pub source: crate::TenancyError,
}

#[derive(Debug, Default)]
pub struct AuditMetrics {
    written: AtomicU64,
    failures: AtomicU64,
}

impl AuditMetrics {
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, failure: &AuditWriteFailure) {
        let n = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n % FAILURE_LOG_EVERY == 0 {
            tracing::error!(
                target: AUDIT_TARGET,
                failures_total = n,
                entity_type = %failure.entity_type,
                entity_id = %failure.entity_id,
                action = failure.action.as_str(),
                error = %failure.source,
                "audit write failed"
            );
        }
    }
}

struct Inner {
    config: AuditConfig,
    metrics: Arc<AuditMetrics>,
    queue: Option<writer::QueueHandle>,
}

/// Shared audit logger. Cloning is cheap.
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("mode", &self.inner.config.mode)
            .field("written", &self.inner.metrics.written())
            .field("failures", &self.inner.metrics.failures())
            .finish_non_exhaustive()
    }
}

impl AuditLogger {
    /// Build a logger for `config.mode`.
    ///
    /// In [`AuditMode::Queued`] this spawns the writer task, so it must be called
    /// inside a Tokio runtime.
    #[must_use]
    pub fn new(config: AuditConfig, store: IsolationStore) -> Self {
        let metrics = Arc::new(AuditMetrics::default());
        let queue = match config.mode {
            AuditMode::Inline => None,
            AuditMode::Queued => Some(writer::spawn(store, Arc::clone(&metrics))),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                metrics,
                queue,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuditConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn metrics(&self) -> &AuditMetrics {
        &self.inner.metrics
    }

    /// Wait until every queued entry has been written. No-op in inline mode.
    pub async fn flush(&self) {
        if let Some(queue) = &self.inner.queue {
            queue.flush().await;
        }
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.inner.queue.is_some()
    }

    pub(crate) fn enqueue(&self, records: Vec<AuditRecord>) {
        if let Some(queue) = &self.inner.queue {
            queue.send(records, &self.inner.metrics);
        }
    }

    pub(crate) fn is_sensitive(&self, entity_type: &str) -> bool {
        self.inner
            .config
            .sensitive_entities
            .iter()
            .any(|e| e == entity_type)
    }

    pub(crate) fn redacted_fields(&self) -> &[String] {
        &self.inner.config.redacted_fields
    }
}
