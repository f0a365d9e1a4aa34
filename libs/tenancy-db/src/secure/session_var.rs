use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr};
use tenancy_security::TenantId;

use crate::TenancyError;
use crate::sql;

/// Name of the server-side setting read by every PostgreSQL isolation policy.
pub const TENANT_SETTING: &str = "app.current_tenant_id";

/// The session-scoped tenant variable, wrapped as a capability.
///
/// Exactly two primitives exist. `get_current_tenant` is public. `set_current_tenant`
/// and `clear` are crate-private and only reached through the context manager.
///
/// On PostgreSQL the setter also writes [`TENANT_SETTING`] with `is_local = true`,
/// so the server value lives exactly as long as the pinned transaction.
#[derive(Debug, Default)]
pub struct SessionVar {
    current: Option<TenantId>,
}

impl SessionVar {
    #[must_use]
    pub fn get_current_tenant(&self) -> Option<TenantId> {
        self.current
    }

    pub(crate) async fn set_current_tenant<C>(
        &mut self,
        conn: &C,
        tenant: TenantId,
    ) -> Result<(), DbErr>
    where
        C: ConnectionTrait,
    {
        if conn.get_database_backend() == DatabaseBackend::Postgres {
            sql::exec(
                conn,
                "SELECT set_config($1, $2, true)",
                vec![TENANT_SETTING.into(), tenant.to_string().into()],
            )
            .await?;
        }
        self.current = Some(tenant);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.current = None;
    }

    pub(crate) fn require(&self) -> Result<TenantId, TenancyError> {
        self.current.ok_or(TenancyError::MissingTenant)
    }
}

/// Reads the server-side tenant setting of a freshly acquired session.
///
/// A custom setting that was once assigned reads back as an empty string after reset,
/// so both `NULL` and `''` mean "unbound".
pub(crate) async fn server_value<C>(conn: &C) -> Result<Option<String>, DbErr>
where
    C: ConnectionTrait,
{
    if conn.get_database_backend() != DatabaseBackend::Postgres {
        return Ok(None);
    }
    let row = sql::fetch_one(
        conn,
        "SELECT current_setting($1, true) AS v",
        vec![TENANT_SETTING.into()],
    )
    .await?;
    let value = match row {
        Some(row) => row.try_get::<Option<String>>("", "v")?,
        None => None,
    };
    Ok(value.filter(|v| !v.is_empty()))
}
