use sea_orm::{ActiveModelBehavior, ActiveModelTrait, IntoActiveModel, Value};
use serde::Serialize;
use tenancy_security::{ActorId, TenantId};

use crate::TenancyError;
use crate::audit::{self, AuditFilter, AuditPage, AuditScope, DateRange, ExportFormat, Page};
use crate::secure::{
    IsolatedEntity, SecureSelect, StoreSession, delete_isolated, ensure_writable, entity_name,
    insert_isolated, primary_value, update_isolated,
};

/// Business-facing handle for one unit of work.
///
/// Every operation runs on the session pinned for this unit of work and carries the
/// isolation predicate. Mutations are audited automatically: creates with the full
/// after-image, deletes with the full pre-image, updates with the changed fields
/// only. Pre-images are read under the same bound tenant right before the write.
pub struct UnitOfWork {
    session: StoreSession,
    audit: AuditScope,
    tenant: TenantId,
    actor: ActorId,
}

impl UnitOfWork {
    pub(crate) fn new(
        session: StoreSession,
        audit: AuditScope,
        tenant: TenantId,
        actor: ActorId,
    ) -> Self {
        Self {
            session,
            audit,
            tenant,
            actor,
        }
    }

    pub(crate) fn into_parts(self) -> (StoreSession, AuditScope) {
        (self.session, self.audit)
    }

    #[must_use]
    pub fn tenant_id(&self) -> TenantId {
        self.tenant
    }

    #[must_use]
    pub fn actor_id(&self) -> ActorId {
        self.actor
    }

    /// Predicate-filtered select; reads of sensitive entities are audited.
    pub fn select<E>(&self) -> SecureSelect<'_, E>
    where
        E: IsolatedEntity,
        E::Model: Serialize + Send + Sync,
    {
        SecureSelect::new(self.session.txn(), Some(self.tenant), Some(&self.audit))
    }

    /// # Errors
    /// `Db` if the query fails.
    pub async fn find_by_id<E>(&self, id: impl Into<Value>) -> Result<Option<E::Model>, TenancyError>
    where
        E: IsolatedEntity,
        E::Model: Serialize + Send + Sync,
    {
        self.select::<E>().and_id(id).one().await
    }

    /// # Errors
    /// `CrossTenantWrite` if the model names another tenant, `AppendOnly`, or `Db`.
    pub async fn insert<E>(&self, am: E::ActiveModel) -> Result<E::Model, TenancyError>
    where
        E: IsolatedEntity,
        E::Model: IntoActiveModel<E::ActiveModel> + Serialize + Send + Sync,
        E::ActiveModel: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send,
    {
        let created =
            insert_isolated::<E, _>(self.session.txn(), self.session.var(), am).await?;
        self.audit.on_create::<E>(self.session.txn(), &created).await;
        Ok(created)
    }

    /// # Errors
    /// `NotFound` when the row is not visible to the bound tenant (whether or not it
    /// exists elsewhere), `CrossTenantWrite`, `AppendOnly`, or `Db`.
    pub async fn update<E>(&self, am: E::ActiveModel) -> Result<E::Model, TenancyError>
    where
        E: IsolatedEntity,
        E::Model: Serialize + Send + Sync,
        E::ActiveModel: ActiveModelTrait<Entity = E> + Send,
    {
        ensure_writable::<E>()?;
        let id = primary_value::<E>(&am)?;
        let before = self.pre_image::<E>(id).await?;
        let updated =
            update_isolated::<E, _>(self.session.txn(), self.session.var(), am).await?;
        self.audit
            .on_update::<E>(self.session.txn(), &before, &updated)
            .await;
        Ok(updated)
    }

    /// # Errors
    /// `NotFound` when the row is not visible to the bound tenant, `AppendOnly`, or
    /// `Db`.
    pub async fn delete<E>(&self, id: impl Into<Value>) -> Result<(), TenancyError>
    where
        E: IsolatedEntity,
        E::Model: Serialize + Send + Sync,
    {
        ensure_writable::<E>()?;
        let id = id.into();
        let before = self.pre_image::<E>(id.clone()).await?;
        delete_isolated::<E, _>(self.session.txn(), self.session.var(), id).await?;
        self.audit.on_delete::<E>(self.session.txn(), &before).await;
        Ok(())
    }

    async fn pre_image<E>(&self, id: Value) -> Result<E::Model, TenancyError>
    where
        E: IsolatedEntity,
        E::Model: Serialize + Send + Sync,
    {
        self.session
            .select::<E>()
            .and_id(id)
            .one()
            .await?
            .ok_or_else(|| TenancyError::not_found(entity_name::<E>()))
    }

    /// Audit entries of `tenant`, newest first.
    ///
    /// # Errors
    /// `CrossTenantRead` unless `tenant` is the bound tenant, or `Db`.
    pub async fn list_audit_entries(
        &self,
        tenant: TenantId,
        filter: &AuditFilter,
        page: Page,
    ) -> Result<AuditPage, TenancyError> {
        audit::list_entries(&self.session, tenant, filter, page).await
    }

    /// Audit entries of `tenant` within `range`, oldest first, rendered as `format`.
    ///
    /// # Errors
    /// `CrossTenantRead` unless `tenant` is the bound tenant, or `Db`.
    pub async fn export_audit_report(
        &self,
        tenant: TenantId,
        range: DateRange,
        format: ExportFormat,
    ) -> Result<Vec<u8>, TenancyError> {
        audit::export_report(&self.session, tenant, range, format).await
    }
}
