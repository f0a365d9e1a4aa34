use sea_orm::{EntityName, EntityTrait};

/// Contract for entities stored in tenant-isolated tables.
///
/// Both columns are declared explicitly; there is no implicit default.
///
/// # Example
/// ```rust,ignore
/// impl IsolatedEntity for client::Entity {
///     fn tenant_col() -> Self::Column {
///         client::Column::TenantId
///     }
///     fn id_col() -> Self::Column {
///         client::Column::Id
///     }
/// }
/// ```
///
/// The tenant registry is the one entity whose tenant column is its own primary key:
/// a tenant sees only its own record.
pub trait IsolatedEntity: EntityTrait {
    /// Column holding the owning tenant.
    fn tenant_col() -> Self::Column;

    /// Primary key column; used to address single rows for update, delete and audit.
    fn id_col() -> Self::Column;

    /// Rows are written only by the crate itself. Inserts, updates and deletes
    /// through a session or unit of work are refused.
    const APPEND_ONLY: bool = false;
}

/// Entity type name recorded in audit entries (the table name).
pub(crate) fn entity_name<E: EntityTrait>() -> String {
    E::default().table_name().to_owned()
}
