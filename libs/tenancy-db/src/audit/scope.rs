use chrono::Utc;
use parking_lot::Mutex;
use sea_orm::{DatabaseTransaction, IdenStatic};
use serde::Serialize;
use tenancy_security::{ActorId, TenantId};

use crate::audit::{AuditAction, AuditLogger, AuditRecord, entity, snapshot, writer};
use crate::secure::{IsolatedEntity, entity_name};

/// Audit state of one unit of work: who acts, for which tenant, and the entries
/// waiting for commit in queued mode.
pub struct AuditScope {
    logger: AuditLogger,
    tenant: TenantId,
    actor: ActorId,
    pending: Mutex<Vec<AuditRecord>>,
}

impl AuditScope {
    pub(crate) fn new(logger: AuditLogger, tenant: TenantId, actor: ActorId) -> Self {
        Self {
            logger,
            tenant,
            actor,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn logger(&self) -> &AuditLogger {
        &self.logger
    }

    fn snapshot<E>(&self, model: &E::Model) -> serde_json::Value
    where
        E: IsolatedEntity,
        E::Model: Serialize,
    {
        snapshot::capture(model, self.logger.redacted_fields())
    }

    fn record<E>(
        &self,
        action: AuditAction,
        entity_id: String,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> AuditRecord
    where
        E: IsolatedEntity,
    {
        AuditRecord {
            tenant_id: self.tenant,
            actor_id: self.actor,
            entity_type: entity_name::<E>(),
            entity_id,
            action,
            before,
            after,
            occurred_at: Utc::now(),
        }
    }

    async fn emit(&self, conn: &DatabaseTransaction, record: AuditRecord) {
        if self.logger.is_queued() {
            self.pending.lock().push(record);
        } else {
            writer::write_inline(conn, self.logger.metrics(), &record).await;
        }
    }

    pub(crate) async fn on_create<E>(&self, conn: &DatabaseTransaction, after: &E::Model)
    where
        E: IsolatedEntity,
        E::Model: Serialize,
    {
        let after = self.snapshot::<E>(after);
        let id = snapshot::entity_id(&after, E::id_col().as_str());
        let record = self.record::<E>(AuditAction::Create, id, None, Some(after));
        self.emit(conn, record).await;
    }

    pub(crate) async fn on_update<E>(
        &self,
        conn: &DatabaseTransaction,
        before: &E::Model,
        after: &E::Model,
    ) where
        E: IsolatedEntity,
        E::Model: Serialize,
    {
        let before = self.snapshot::<E>(before);
        let after = self.snapshot::<E>(after);
        let id = snapshot::entity_id(&after, E::id_col().as_str());
        let (changed_before, changed_after) = snapshot::diff(&before, &after);
        let record =
            self.record::<E>(AuditAction::Update, id, Some(changed_before), Some(changed_after));
        self.emit(conn, record).await;
    }

    pub(crate) async fn on_delete<E>(&self, conn: &DatabaseTransaction, before: &E::Model)
    where
        E: IsolatedEntity,
        E::Model: Serialize,
    {
        let before = self.snapshot::<E>(before);
        let id = snapshot::entity_id(&before, E::id_col().as_str());
        let record = self.record::<E>(AuditAction::Delete, id, Some(before), None);
        self.emit(conn, record).await;
    }

    /// Audit reads of allow-listed sensitive entities; everything else is skipped.
    pub(crate) async fn on_read<E>(&self, conn: &DatabaseTransaction, rows: &[E::Model])
    where
        E: IsolatedEntity,
        E::Model: Serialize,
    {
        let name = entity_name::<E>();
        if name == entity_name::<entity::Entity>() || !self.logger.is_sensitive(&name) {
            return;
        }
        for row in rows {
            let after = self.snapshot::<E>(row);
            let id = snapshot::entity_id(&after, E::id_col().as_str());
            let record = self.record::<E>(AuditAction::Read, id, None, Some(after));
            self.emit(conn, record).await;
        }
    }

    /// Entries buffered for the queued writer; empty in inline mode.
    pub(crate) fn take_pending(&self) -> Vec<AuditRecord> {
        std::mem::take(&mut *self.pending.lock())
    }
}
