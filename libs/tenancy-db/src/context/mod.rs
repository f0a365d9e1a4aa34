//! Tenant context manager.
//!
//! [`TenantContextManager::with_tenant`] is the single entry point the transport
//! layer calls once per unit of work. It acquires a pooled session, binds the
//! tenant on it before the closure runs, and releases the binding on every exit
//! path: commit on `Ok`, rollback on `Err`, and rollback on drop when the future is
//! cancelled or the closure panics.
//!
//! The bound context is also published in a task-local, so [`current_tenant`]
//! works anywhere inside the unit of work without threading arguments through.
//! A nested `with_tenant` for the same tenant finds the running unit of work there
//! and joins it: same session, same transaction, committed by the outermost call.

mod system;
mod unit_of_work;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::DbErr;
use tenancy_security::{ActorId, SecurityContext, TenantId};
use tracing::{debug, info, warn};

use crate::TenancyError;
use crate::audit::{AuditLogger, AuditScope};
use crate::secure::IsolationStore;
use crate::tenants;

pub use system::SystemSession;
pub use unit_of_work::UnitOfWork;

tokio::task_local! {
    static CURRENT: TenantContext;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Tenant,
    /// Read-only, cross-tenant, audited. Reserved for reporting.
    System,
}

/// The ephemeral binding of one unit of work. Never persisted, never shared.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant_id: Option<TenantId>,
    actor_id: ActorId,
    bound_at: DateTime<Utc>,
    kind: ContextKind,
    uow: Weak<UnitOfWork>,
}

impl TenantContext {
    fn tenant(uow: &Arc<UnitOfWork>) -> Self {
        Self {
            tenant_id: Some(uow.tenant_id()),
            actor_id: uow.actor_id(),
            bound_at: Utc::now(),
            kind: ContextKind::Tenant,
            uow: Arc::downgrade(uow),
        }
    }

    fn system(actor_id: ActorId) -> Self {
        Self {
            tenant_id: None,
            actor_id,
            bound_at: Utc::now(),
            kind: ContextKind::System,
            uow: Weak::new(),
        }
    }

    #[must_use]
    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    #[must_use]
    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    #[must_use]
    pub fn bound_at(&self) -> DateTime<Utc> {
        self.bound_at
    }

    #[must_use]
    pub fn kind(&self) -> ContextKind {
        self.kind
    }
}

/// Context of the unit of work running on the current task, if any.
#[must_use]
pub fn current_context() -> Option<TenantContext> {
    CURRENT.try_with(Clone::clone).ok()
}

/// Tenant bound to the current unit of work.
///
/// # Errors
/// `MissingTenant` outside a binding and inside a system context.
pub fn current_tenant() -> Result<TenantId, TenancyError> {
    current_context()
        .and_then(|ctx| ctx.tenant_id)
        .ok_or(TenancyError::MissingTenant)
}

/// Future returned by unit-of-work closures.
pub type UowFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

#[derive(Clone, Debug)]
pub struct TenantContextManager {
    store: IsolationStore,
    audit: AuditLogger,
    system_contexts: Arc<AtomicU64>,
}

impl TenantContextManager {
    #[must_use]
    pub fn new(store: IsolationStore, audit: AuditLogger) -> Self {
        Self {
            store,
            audit,
            system_contexts: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Number of system contexts opened so far.
    #[must_use]
    pub fn system_context_count(&self) -> u64 {
        self.system_contexts.load(Ordering::Relaxed)
    }

    /// Run `f` as one unit of work bound to the context's tenant.
    ///
    /// # Example
    /// ```ignore
    /// let client = manager
    ///     .with_tenant(&ctx, |uow| Box::pin(async move {
    ///         uow.insert::<client::Entity>(client::ActiveModel { .. }).await
    ///     }))
    ///     .await?;
    /// ```
    ///
    /// # Errors
    /// - `MissingTenant` when the context carries no tenant (nil id)
    /// - `Rebind` when called inside a unit of work bound to a different tenant,
    ///   or inside a system context
    /// - anything `f` returns, and session or commit failures
    ///
    /// Inside a unit of work bound to the same tenant, `f` runs on the outer unit of
    /// work and nothing is committed here.
    pub async fn with_tenant<F, T, E>(&self, ctx: &SecurityContext, f: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a UnitOfWork) -> UowFuture<'a, T, E> + Send,
        E: From<TenancyError> + Send,
        T: Send,
    {
        let tenant = ctx.tenant_id().map_err(TenancyError::from)?;
        let actor = ctx.actor_id();
        if let Some(active) = current_context() {
            if active.kind == ContextKind::System || active.tenant_id != Some(tenant) {
                warn!(tenant_id = %tenant, "refused to rebind an active unit of work");
                return Err(TenancyError::Rebind.into());
            }
            if let Some(outer) = active.uow.upgrade() {
                debug!(tenant_id = %tenant, "joined the running unit of work");
                return f(outer.as_ref()).await;
            }
        }

        let uow = Arc::new(self.begin(tenant, actor).await?);
        let res = CURRENT
            .scope(TenantContext::tenant(&uow), f(uow.as_ref()))
            .await;
        // Nested calls hold the unit of work only while they run.
        match Arc::try_unwrap(uow) {
            Ok(uow) => self.finish(uow, res).await,
            Err(_) => {
                warn!(tenant_id = %tenant, "unit of work still shared at exit; rolled back");
                Err(TenancyError::Db(DbErr::Custom("unit of work still shared".to_owned())).into())
            }
        }
    }

    /// Create a tenant registry row.
    ///
    /// The new tenant is bound to a fresh session and inserts its own record through
    /// the enforced path, so no privileged bypass is involved. The creation is audited
    /// under the new tenant.
    ///
    /// # Errors
    /// Session, insert, or commit failures.
    pub async fn provision_tenant(
        &self,
        name: &str,
        actor: ActorId,
    ) -> Result<tenants::Model, TenancyError> {
        let tenant = TenantId::random();
        let uow = self.begin(tenant, actor).await?;
        let res = uow
            .insert::<tenants::Entity>(tenants::ActiveModel {
                id: Set(tenant.as_uuid()),
                name: Set(name.to_owned()),
                created_at: Set(Utc::now()),
            })
            .await;
        let model = self.finish(uow, res).await?;
        info!(tenant_id = %tenant, actor_id = %actor, "tenant provisioned");
        Ok(model)
    }

    /// Run `f` in the read-only cross-tenant system context.
    ///
    /// Every entry is logged at `warn` with actor and reason and counted. On
    /// PostgreSQL row-level security still applies unless the pool's role has
    /// `BYPASSRLS`, so reporting uses a manager built on such a pool.
    ///
    /// # Errors
    /// `Rebind` inside an active unit of work, session failures, or anything `f`
    /// returns.
    pub async fn with_system_context<F, T, E>(
        &self,
        actor: ActorId,
        reason: &str,
        f: F,
    ) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a SystemSession) -> UowFuture<'a, T, E> + Send,
        E: From<TenancyError> + Send,
        T: Send,
    {
        if current_context().is_some() {
            return Err(TenancyError::Rebind.into());
        }
        let n = self.system_contexts.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(actor_id = %actor, reason, system_contexts = n, "entering system context");

        let session = SystemSession::new(self.store.acquire_read_only().await?);
        let res = CURRENT
            .scope(TenantContext::system(actor), f(&session))
            .await;
        session.close().await;
        res
    }

    async fn begin(&self, tenant: TenantId, actor: ActorId) -> Result<UnitOfWork, TenancyError> {
        let mut session = self.store.acquire().await?;
        session.bind(tenant).await?;
        debug!(tenant_id = %tenant, actor_id = %actor, "tenant bound to session");
        Ok(UnitOfWork::new(
            session,
            AuditScope::new(self.audit.clone(), tenant, actor),
            tenant,
            actor,
        ))
    }

    async fn finish<T, E>(&self, uow: UnitOfWork, res: Result<T, E>) -> Result<T, E>
    where
        E: From<TenancyError>,
    {
        let tenant = uow.tenant_id();
        let (session, audit) = uow.into_parts();
        match res {
            Ok(v) => {
                session.commit().await?;
                self.audit.enqueue(audit.take_pending());
                debug!(tenant_id = %tenant, "unit of work committed");
                Ok(v)
            }
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    warn!(tenant_id = %tenant, error = %rollback, "rollback failed");
                }
                debug!(tenant_id = %tenant, "unit of work rolled back");
                Err(e)
            }
        }
    }
}
