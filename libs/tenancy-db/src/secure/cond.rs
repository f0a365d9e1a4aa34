use sea_orm::{ColumnTrait, Condition, Value, sea_query::Expr};
use tenancy_security::TenantId;

use crate::secure::IsolatedEntity;

/// Builds the isolation predicate for entity `E`.
///
/// - Tenant bound: `tenant_col = tenant`.
/// - Nothing bound: deny all (`FALSE`), so the statement touches zero rows.
pub fn tenant_condition<E>(tenant: Option<TenantId>) -> Condition
where
    E: IsolatedEntity,
{
    match tenant {
        Some(tenant) => Condition::all().add(E::tenant_col().eq(tenant.as_uuid())),
        None => deny_all(),
    }
}

/// `id_col = id` for entity `E`.
pub fn id_condition<E>(id: Value) -> Condition
where
    E: IsolatedEntity,
{
    Condition::all().add(E::id_col().eq(id))
}

pub(crate) fn deny_all() -> Condition {
    Condition::all().add(Expr::value(false))
}
