use sea_orm::{Condition, DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter};

use crate::TenancyError;
use crate::secure::IsolatedEntity;

/// Read-only, cross-tenant session handed out by
/// [`TenantContextManager::with_system_context`](super::TenantContextManager::with_system_context).
///
/// Offers reads only; the transaction is always rolled back.
pub struct SystemSession {
    txn: DatabaseTransaction,
}

impl SystemSession {
    pub(super) fn new(txn: DatabaseTransaction) -> Self {
        Self { txn }
    }

    /// # Errors
    /// `Db` if the query fails.
    pub async fn find_all<E>(&self, filter: Condition) -> Result<Vec<E::Model>, TenancyError>
    where
        E: IsolatedEntity,
    {
        Ok(E::find().filter(filter).all(&self.txn).await?)
    }

    /// # Errors
    /// `Db` if the query fails.
    pub async fn count<E>(&self, filter: Condition) -> Result<u64, TenancyError>
    where
        E: IsolatedEntity,
        E::Model: Send + Sync,
    {
        Ok(E::find().filter(filter).count(&self.txn).await?)
    }

    pub(super) async fn close(self) {
        let _ = self.txn.rollback().await;
    }
}
