use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ActiveValue, ConnectionTrait, DatabaseBackend,
    DatabaseConnection, DatabaseTransaction, EntityTrait, IdenStatic, IntoActiveModel, Iterable,
    QueryFilter, TransactionTrait, Value,
};
use serde::Serialize;
use tenancy_security::TenantId;

use crate::TenancyError;
use crate::secure::session_var::{self, SessionVar};
use crate::secure::{IsolatedEntity, SecureSelect, cond, entity_name};

/// Entry point to isolated tables.
///
/// Hands out [`StoreSession`]s: one pooled connection pinned inside one transaction.
/// Sessions come out unbound; only the context manager can bind them.
#[derive(Clone)]
pub struct IsolationStore {
    conn: DatabaseConnection,
}

impl std::fmt::Debug for IsolationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationStore")
            .field("backend", &self.conn.get_database_backend())
            .finish_non_exhaustive()
    }
}

impl IsolationStore {
    pub(crate) fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    #[must_use]
    pub fn backend(&self) -> DatabaseBackend {
        self.conn.get_database_backend()
    }

    /// Acquire an unbound session.
    ///
    /// On PostgreSQL the session is refused if the server still carries a tenant
    /// setting; the transaction is rolled back, which discards the value.
    ///
    /// # Errors
    /// `StaleSession` on a leftover binding, `Db` if the transaction cannot start.
    pub async fn acquire(&self) -> Result<StoreSession, TenancyError> {
        let txn = self.conn.begin().await?;
        if let Some(stale) = session_var::server_value(&txn).await? {
            tracing::error!(stale_tenant = %stale, "pooled session carried a tenant binding");
            let _ = txn.rollback().await;
            return Err(TenancyError::StaleSession);
        }
        Ok(StoreSession {
            txn,
            var: SessionVar::default(),
        })
    }

    /// Acquire a session for the read-only system context.
    pub(crate) async fn acquire_read_only(&self) -> Result<DatabaseTransaction, TenancyError> {
        let txn = self.conn.begin().await?;
        if txn.get_database_backend() == DatabaseBackend::Postgres {
            txn.execute_unprepared("SET TRANSACTION READ ONLY").await?;
        }
        Ok(txn)
    }
}

/// One pinned session: every statement of a unit of work runs on it.
///
/// All reads and writes carry the isolation predicate for the bound tenant. With no
/// tenant bound, reads return nothing and writes fail with `MissingTenant`.
pub struct StoreSession {
    txn: DatabaseTransaction,
    var: SessionVar,
}

impl StoreSession {
    /// `getCurrentTenant`.
    #[must_use]
    pub fn current_tenant(&self) -> Option<TenantId> {
        self.var.get_current_tenant()
    }

    pub(crate) async fn bind(&mut self, tenant: TenantId) -> Result<(), TenancyError> {
        self.var.set_current_tenant(&self.txn, tenant).await?;
        Ok(())
    }

    pub(crate) fn txn(&self) -> &DatabaseTransaction {
        &self.txn
    }

    pub(crate) fn var(&self) -> &SessionVar {
        &self.var
    }

    pub fn select<E>(&self) -> SecureSelect<'_, E>
    where
        E: IsolatedEntity,
        E::Model: Serialize + Send + Sync,
    {
        SecureSelect::new(&self.txn, self.var.get_current_tenant(), None)
    }

    /// # Errors
    /// `MissingTenant`, `CrossTenantWrite`, or `Db`.
    pub async fn insert<E>(&self, am: E::ActiveModel) -> Result<E::Model, TenancyError>
    where
        E: IsolatedEntity,
        E::Model: IntoActiveModel<E::ActiveModel>,
        E::ActiveModel: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send,
    {
        insert_isolated::<E, _>(&self.txn, &self.var, am).await
    }

    /// # Errors
    /// `MissingTenant`, `CrossTenantWrite`, `NotFound` (also for rows of other
    /// tenants), or `Db`.
    pub async fn update<E>(&self, am: E::ActiveModel) -> Result<E::Model, TenancyError>
    where
        E: IsolatedEntity,
        E::ActiveModel: ActiveModelTrait<Entity = E> + Send,
    {
        update_isolated::<E, _>(&self.txn, &self.var, am).await
    }

    /// # Errors
    /// `MissingTenant`, `NotFound` (also for rows of other tenants), or `Db`.
    pub async fn delete<E>(&self, id: impl Into<Value>) -> Result<u64, TenancyError>
    where
        E: IsolatedEntity,
    {
        delete_isolated::<E, _>(&self.txn, &self.var, id.into()).await
    }

    /// Clear the binding and commit.
    ///
    /// # Errors
    /// Returns `Db` if the commit fails; on PostgreSQL this is where `WITH CHECK`
    /// violations surface.
    pub async fn commit(mut self) -> Result<(), TenancyError> {
        self.var.clear();
        self.txn.commit().await?;
        Ok(())
    }

    /// Clear the binding and roll back.
    ///
    /// # Errors
    /// Returns `Db` if the rollback fails.
    pub async fn rollback(mut self) -> Result<(), TenancyError> {
        self.var.clear();
        self.txn.rollback().await?;
        Ok(())
    }
}

/// Forces the tenant column of a write to the bound tenant.
///
/// Unset on insert: filled in. Set to anything else: `CrossTenantWrite`.
pub(crate) fn stamp_tenant<E>(
    am: &mut E::ActiveModel,
    tenant: TenantId,
    fill_missing: bool,
) -> Result<(), TenancyError>
where
    E: IsolatedEntity,
    E::ActiveModel: ActiveModelTrait<Entity = E>,
{
    let col = E::tenant_col();
    let bound = Value::from(tenant.as_uuid());
    match am.get(col) {
        ActiveValue::NotSet => {
            if fill_missing {
                am.set(col, bound);
            }
            Ok(())
        }
        ActiveValue::Set(v) | ActiveValue::Unchanged(v) if v == bound => Ok(()),
        ActiveValue::Set(_) | ActiveValue::Unchanged(_) => {
            tracing::warn!(
                entity = %entity_name::<E>(),
                tenant_id = %tenant,
                "rejected write targeting another tenant"
            );
            Err(TenancyError::CrossTenantWrite {
                entity: entity_name::<E>(),
            })
        }
    }
}

/// Refuse direct writes to append-only entities.
pub(crate) fn ensure_writable<E: IsolatedEntity>() -> Result<(), TenancyError> {
    if E::APPEND_ONLY {
        tracing::warn!(entity = %entity_name::<E>(), "rejected direct write to append-only entity");
        return Err(TenancyError::AppendOnly {
            entity: entity_name::<E>(),
        });
    }
    Ok(())
}

pub(crate) fn primary_value<E>(am: &E::ActiveModel) -> Result<Value, TenancyError>
where
    E: IsolatedEntity,
    E::ActiveModel: ActiveModelTrait<Entity = E>,
{
    am.get(E::id_col())
        .into_value()
        .ok_or(TenancyError::InvalidEntity("primary key is not set"))
}

pub(crate) async fn insert_isolated<E, C>(
    conn: &C,
    var: &SessionVar,
    am: E::ActiveModel,
) -> Result<E::Model, TenancyError>
where
    E: IsolatedEntity,
    C: ConnectionTrait,
    E::Model: IntoActiveModel<E::ActiveModel>,
    E::ActiveModel: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send,
{
    ensure_writable::<E>()?;
    insert_as::<E, C>(conn, var.require()?, am).await
}

/// Insert on behalf of an explicit tenant that the caller has already bound.
///
/// Skips the append-only check: this is the audit writer's path.
pub(crate) async fn insert_as<E, C>(
    conn: &C,
    tenant: TenantId,
    mut am: E::ActiveModel,
) -> Result<E::Model, TenancyError>
where
    E: IsolatedEntity,
    C: ConnectionTrait,
    E::Model: IntoActiveModel<E::ActiveModel>,
    E::ActiveModel: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send,
{
    stamp_tenant::<E>(&mut am, tenant, true)?;
    Ok(am.insert(conn).await?)
}

pub(crate) async fn update_isolated<E, C>(
    conn: &C,
    var: &SessionVar,
    am: E::ActiveModel,
) -> Result<E::Model, TenancyError>
where
    E: IsolatedEntity,
    C: ConnectionTrait,
    E::ActiveModel: ActiveModelTrait<Entity = E> + Send,
{
    ensure_writable::<E>()?;
    let tenant = var.require()?;
    let mut am = am;
    stamp_tenant::<E>(&mut am, tenant, false)?;
    let id = primary_value::<E>(&am)?;
    let scope = cond::tenant_condition::<E>(Some(tenant));

    let id_name = E::id_col().as_str().to_owned();
    let has_changes = E::Column::iter()
        .filter(|c| c.as_str() != id_name)
        .any(|c| matches!(am.get(c), ActiveValue::Set(_)));
    if has_changes {
        let res = E::update_many()
            .set(am)
            .filter(cond::id_condition::<E>(id.clone()))
            .filter(scope.clone())
            .exec(conn)
            .await?;
        if res.rows_affected == 0 {
            return Err(TenancyError::not_found(entity_name::<E>()));
        }
    }

    E::find()
        .filter(cond::id_condition::<E>(id))
        .filter(scope)
        .one(conn)
        .await?
        .ok_or_else(|| TenancyError::not_found(entity_name::<E>()))
}

pub(crate) async fn delete_isolated<E, C>(
    conn: &C,
    var: &SessionVar,
    id: Value,
) -> Result<u64, TenancyError>
where
    E: IsolatedEntity,
    C: ConnectionTrait,
{
    ensure_writable::<E>()?;
    let tenant = var.require()?;
    let res = E::delete_many()
        .filter(cond::id_condition::<E>(id))
        .filter(cond::tenant_condition::<E>(Some(tenant)))
        .exec(conn)
        .await?;
    if res.rows_affected == 0 {
        return Err(TenancyError::not_found(entity_name::<E>()));
    }
    Ok(res.rows_affected)
}
