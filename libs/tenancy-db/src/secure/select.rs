use sea_orm::{
    DatabaseTransaction, EntityTrait, IntoSimpleExpr, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Value, sea_query::IntoCondition,
};
use serde::Serialize;

use crate::TenancyError;
use crate::audit::AuditScope;
use crate::secure::{IsolatedEntity, cond};

/// A `SeaORM` select that already carries the isolation predicate.
///
/// There is no way to obtain one without the predicate: it is built only by
/// [`StoreSession::select`](crate::secure::StoreSession::select) and
/// [`UnitOfWork::select`](crate::context::UnitOfWork::select). Further filters are
/// AND-ed onto it.
#[must_use]
pub struct SecureSelect<'s, E: EntityTrait> {
    inner: sea_orm::Select<E>,
    conn: &'s DatabaseTransaction,
    audit: Option<&'s AuditScope>,
}

impl<'s, E> SecureSelect<'s, E>
where
    E: IsolatedEntity,
    E::Model: Serialize + Send + Sync,
{
    pub(crate) fn new(
        conn: &'s DatabaseTransaction,
        tenant: Option<tenancy_security::TenantId>,
        audit: Option<&'s AuditScope>,
    ) -> Self {
        Self {
            inner: E::find().filter(cond::tenant_condition::<E>(tenant)),
            conn,
            audit,
        }
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: IntoCondition,
    {
        self.inner = QueryFilter::filter(self.inner, filter);
        self
    }

    /// Narrow to one primary key value.
    pub fn and_id(self, id: impl Into<Value>) -> Self {
        self.filter(cond::id_condition::<E>(id.into()))
    }

    pub fn order_by_asc<C>(mut self, col: C) -> Self
    where
        C: IntoSimpleExpr,
    {
        self.inner = QueryOrder::order_by_asc(self.inner, col);
        self
    }

    pub fn order_by_desc<C>(mut self, col: C) -> Self
    where
        C: IntoSimpleExpr,
    {
        self.inner = QueryOrder::order_by_desc(self.inner, col);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.inner = QuerySelect::limit(self.inner, limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.inner = QuerySelect::offset(self.inner, offset);
        self
    }

    /// # Errors
    /// Returns `TenancyError::Db` if the query fails.
    pub async fn all(self) -> Result<Vec<E::Model>, TenancyError> {
        let rows = self.inner.all(self.conn).await?;
        if let Some(audit) = self.audit {
            audit.on_read::<E>(self.conn, &rows).await;
        }
        Ok(rows)
    }

    /// # Errors
    /// Returns `TenancyError::Db` if the query fails.
    pub async fn one(self) -> Result<Option<E::Model>, TenancyError> {
        let row = self.inner.one(self.conn).await?;
        if let (Some(audit), Some(row)) = (self.audit, row.as_ref()) {
            audit.on_read::<E>(self.conn, std::slice::from_ref(row)).await;
        }
        Ok(row)
    }

    /// # Errors
    /// Returns `TenancyError::Db` if the query fails.
    pub async fn count(self) -> Result<u64, TenancyError>
    where
        E::Model: sea_orm::FromQueryResult,
    {
        Ok(self.inner.count(self.conn).await?)
    }
}
