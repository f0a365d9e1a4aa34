use std::sync::Arc;

use sea_orm::{ActiveValue::Set, ConnectionTrait, DbErr, TransactionTrait};
use tenancy_security::TenantId;
use tokio::sync::{mpsc, oneshot};

use crate::TenancyError;
use crate::audit::{AuditMetrics, AuditRecord, AuditWriteFailure, entity};
use crate::secure::{IsolationStore, insert_as};

fn to_active_model(record: &AuditRecord) -> entity::ActiveModel {
    entity::ActiveModel {
        id: Set(uuid::Uuid::new_v4()),
        tenant_id: Set(record.tenant_id.as_uuid()),
        actor_id: Set(record.actor_id.as_uuid()),
        entity_type: Set(record.entity_type.clone()),
        entity_id: Set(record.entity_id.clone()),
        action: Set(record.action),
        before_state: Set(record.before.clone()),
        after_state: Set(record.after.clone()),
        occurred_at: Set(record.occurred_at),
    }
}

fn failure(record: &AuditRecord, source: TenancyError) -> AuditWriteFailure {
    AuditWriteFailure {
        entity_type: record.entity_type.clone(),
        entity_id: record.entity_id.clone(),
        action: record.action,
        source,
    }
}

/// Insert one entry under a savepoint of `conn`, which must already be bound to
/// `tenant`. A failure rolls back the savepoint only.
async fn insert_under_savepoint<C>(
    conn: &C,
    tenant: TenantId,
    record: &AuditRecord,
) -> Result<(), TenancyError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let savepoint = conn.begin().await?;
    match insert_as::<entity::Entity, _>(&savepoint, tenant, to_active_model(record)).await {
        Ok(_) => {
            savepoint.commit().await?;
            Ok(())
        }
        Err(e) => {
            let _ = savepoint.rollback().await;
            Err(e)
        }
    }
}

/// Write inside the caller's transaction. Never fails.
pub(crate) async fn write_inline<C>(conn: &C, metrics: &AuditMetrics, record: &AuditRecord)
where
    C: ConnectionTrait + TransactionTrait,
{
    match insert_under_savepoint(conn, record.tenant_id, record).await {
        Ok(()) => metrics.record_written(),
        Err(e) => metrics.record_failure(&failure(record, e)),
    }
}

/// Write a run of entries of one tenant in a fresh session bound to that tenant.
async fn write_run(store: &IsolationStore, metrics: &AuditMetrics, run: &[AuditRecord]) {
    let Some(first) = run.first() else {
        return;
    };
    let tenant = first.tenant_id;
    let session = async {
        let mut session = store.acquire().await?;
        session.bind(tenant).await?;
        Ok::<_, TenancyError>(session)
    }
    .await;

    let session = match session {
        Ok(s) => s,
        Err(e) => {
            let reason = e.to_string();
            for record in run {
                metrics.record_failure(&failure(
                    record,
                    TenancyError::Db(DbErr::Custom(reason.clone())),
                ));
            }
            return;
        }
    };

    let mut outcomes = Vec::with_capacity(run.len());
    for record in run {
        outcomes.push(insert_under_savepoint(session.txn(), tenant, record).await);
    }

    match session.commit().await {
        Ok(()) => {
            for (record, outcome) in run.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => metrics.record_written(),
                    Err(e) => metrics.record_failure(&failure(record, e)),
                }
            }
        }
        Err(e) => {
            let reason = e.to_string();
            for record in run {
                metrics.record_failure(&failure(
                    record,
                    TenancyError::Db(DbErr::Custom(reason.clone())),
                ));
            }
        }
    }
}

/// Write entries in arrival order, one session per run of consecutive same-tenant
/// entries.
async fn write_batch(store: &IsolationStore, metrics: &AuditMetrics, records: &[AuditRecord]) {
    for run in records.chunk_by(|a, b| a.tenant_id == b.tenant_id) {
        write_run(store, metrics, run).await;
    }
}

enum Msg {
    Records(Vec<AuditRecord>),
    Flush(oneshot::Sender<()>),
}

/// Sender side of the single audit writer task.
///
/// One FIFO channel and one consumer: entries are stored in the order their units of
/// work committed, so per-tenant order matches the mutations.
pub(crate) struct QueueHandle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl QueueHandle {
    pub(crate) fn send(&self, records: Vec<AuditRecord>, metrics: &AuditMetrics) {
        if records.is_empty() {
            return;
        }
        if let Err(mpsc::error::SendError(Msg::Records(lost))) =
            self.tx.send(Msg::Records(records))
        {
            for record in &lost {
                metrics.record_failure(&failure(
                    record,
                    TenancyError::Db(DbErr::Custom("audit writer stopped".to_owned())),
                ));
            }
        }
    }

    pub(crate) async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Msg::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

pub(crate) fn spawn(store: IsolationStore, metrics: Arc<AuditMetrics>) -> QueueHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Records(records) => write_batch(&store, &metrics, &records).await,
                Msg::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!(target: crate::audit::AUDIT_TARGET, "audit writer stopped");
    });
    QueueHandle { tx }
}
