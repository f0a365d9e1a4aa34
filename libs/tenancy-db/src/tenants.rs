//! The global tenant registry.
//!
//! Self-isolating: its tenant column is its own primary key, so a bound tenant sees
//! exactly one row, its own. Rows are created by
//! [`TenantContextManager::provision_tenant`](crate::context::TenantContextManager::provision_tenant).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl crate::secure::IsolatedEntity for Entity {
    fn tenant_col() -> Self::Column {
        Column::Id
    }
    fn id_col() -> Self::Column {
        Column::Id
    }
}
