//! Introspection and the per-table phases of an isolation step.
//!
//! Every phase looks at the live schema first and returns the [`SchemaChange`]s it
//! actually made. PostgreSQL alters in place; SQLite promotes and demotes the tenant
//! column by rebuilding the table.

use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::migrate::sqlite_rebuild::{self, TenantColumn};
use crate::migrate::{
    MAX_REPORTED_ORPHANS, MigrateError, OrphanPolicy, SchemaChange, TENANT_COLUMN,
    TenantColumnPlan, TenantSource, fk_name, index_name,
};
use crate::secure::IsolationPolicy;
use crate::secure::policy::{self, PolicyState};
use crate::sql::{self, quote};

pub(crate) fn is_pg<C: ConnectionTrait>(conn: &C) -> bool {
    conn.get_database_backend() == DatabaseBackend::Postgres
}

pub(crate) async fn table_exists<C>(conn: &C, table: &str) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let sql = if is_pg(conn) {
        "SELECT COUNT(*) FROM information_schema.tables \
         WHERE table_schema = current_schema() AND table_name = $1"
    } else {
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = $1"
    };
    Ok(sql::count(conn, sql, vec![table.into()]).await? > 0)
}

/// Constraints on an existing tenant column before a step touched it. Recorded in
/// the step history so revert puts back exactly what was there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TenantColumnState {
    pub(crate) not_null: bool,
    pub(crate) tenant_fk: bool,
}

/// `None` when `table` has no tenant column.
pub(crate) async fn tenant_column_state<C>(
    conn: &C,
    table: &str,
) -> Result<Option<TenantColumnState>, DbErr>
where
    C: ConnectionTrait,
{
    let Some(nullable) = column_nullable(conn, table, TENANT_COLUMN).await? else {
        return Ok(None);
    };
    Ok(Some(TenantColumnState {
        not_null: !nullable,
        tenant_fk: tenant_fk_exists(conn, table).await?,
    }))
}

/// `Some(nullable)` when the column exists.
pub(crate) async fn column_nullable<C>(
    conn: &C,
    table: &str,
    column: &str,
) -> Result<Option<bool>, DbErr>
where
    C: ConnectionTrait,
{
    let values = vec![table.into(), column.into()];
    if is_pg(conn) {
        let row = sql::fetch_one(
            conn,
            "SELECT is_nullable::text AS is_nullable FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2",
            values,
        )
        .await?;
        row.map(|r| r.try_get::<String>("", "is_nullable").map(|v| v == "YES"))
            .transpose()
    } else {
        let row = sql::fetch_one(
            conn,
            r#"SELECT "notnull" AS not_null FROM pragma_table_info($1) WHERE name = $2"#,
            values,
        )
        .await?;
        row.map(|r| r.try_get::<i64>("", "not_null").map(|v| v == 0))
            .transpose()
    }
}

pub(crate) async fn index_exists<C>(conn: &C, name: &str) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let sql = if is_pg(conn) {
        "SELECT COUNT(*) FROM pg_indexes WHERE schemaname = current_schema() AND indexname = $1"
    } else {
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = $1"
    };
    Ok(sql::count(conn, sql, vec![name.into()]).await? > 0)
}

pub(crate) async fn tenant_fk_exists<C>(conn: &C, table: &str) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let n = if is_pg(conn) {
        sql::count(
            conn,
            "SELECT COUNT(*) FROM information_schema.table_constraints \
             WHERE table_schema = current_schema() AND table_name = $1 \
               AND constraint_name = $2 AND constraint_type = 'FOREIGN KEY'",
            vec![table.into(), fk_name(table).into()],
        )
        .await?
    } else {
        sql::count(
            conn,
            r#"SELECT COUNT(*) FROM pragma_foreign_key_list($1) WHERE "from" = $2 AND "table" = 'tenants'"#,
            vec![table.into(), TENANT_COLUMN.into()],
        )
        .await?
    };
    Ok(n > 0)
}

pub(crate) async fn require_table<C>(conn: &C, table: &str) -> Result<(), MigrateError>
where
    C: ConnectionTrait,
{
    if table_exists(conn, table).await? {
        Ok(())
    } else {
        Err(MigrateError::MissingTable(table.to_owned()))
    }
}

/// Phase 1.
pub(crate) async fn lock_table<C>(conn: &C, table: &str) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    // SQLite takes the database write lock with the first write of the transaction.
    if is_pg(conn) {
        conn.execute_unprepared(&format!(
            "LOCK TABLE {} IN ACCESS EXCLUSIVE MODE",
            quote(table)
        ))
        .await?;
    }
    Ok(())
}

/// Phase 2.
pub(crate) async fn add_tenant_column<C>(
    conn: &C,
    table: &str,
) -> Result<Option<SchemaChange>, DbErr>
where
    C: ConnectionTrait,
{
    if column_nullable(conn, table, TENANT_COLUMN).await?.is_some() {
        return Ok(None);
    }
    let ty = if is_pg(conn) { "UUID" } else { "BLOB" };
    conn.execute_unprepared(&format!(
        "ALTER TABLE {} ADD COLUMN {} {ty} NULL",
        quote(table),
        quote(TENANT_COLUMN)
    ))
    .await?;
    Ok(Some(SchemaChange::ColumnAdded {
        table: table.to_owned(),
        column: TENANT_COLUMN.to_owned(),
    }))
}

async fn count_missing<C>(conn: &C, table: &str) -> Result<i64, DbErr>
where
    C: ConnectionTrait,
{
    sql::count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
            quote(table),
            quote(TENANT_COLUMN)
        ),
        vec![],
    )
    .await
}

/// Phase 3: fill `tenant_id` where it is still NULL, then apply the orphan policy.
pub(crate) async fn backfill<C>(
    conn: &C,
    plan: &TenantColumnPlan,
) -> Result<Option<SchemaChange>, MigrateError>
where
    C: ConnectionTrait,
{
    let table = quote(&plan.table);
    let col = quote(TENANT_COLUMN);
    let statement = match &plan.source {
        TenantSource::Parent {
            foreign_key,
            parent_table,
            parent_key,
            parent_tenant_column,
        } => {
            require_table(conn, parent_table).await?;
            if column_nullable(conn, parent_table, parent_tenant_column)
                .await?
                .is_none()
            {
                return Err(MigrateError::InvalidPlan(format!(
                    "parent '{parent_table}' of '{}' has no column '{parent_tenant_column}'",
                    plan.table
                )));
            }
            let (parent, pk, ptc, fk) = (
                quote(parent_table),
                quote(parent_key),
                quote(parent_tenant_column),
                quote(foreign_key),
            );
            Some(format!(
                "UPDATE {table} SET {col} = \
                   (SELECT p.{ptc} FROM {parent} p WHERE p.{pk} = {table}.{fk}) \
                 WHERE {col} IS NULL AND EXISTS \
                   (SELECT 1 FROM {parent} p WHERE p.{pk} = {table}.{fk} AND p.{ptc} IS NOT NULL)"
            ))
        }
        TenantSource::Column { column } => {
            if column_nullable(conn, &plan.table, column).await?.is_none() {
                return Err(MigrateError::InvalidPlan(format!(
                    "'{}' has no column '{column}'",
                    plan.table
                )));
            }
            let src = if is_pg(conn) {
                format!("CAST({} AS UUID)", quote(column))
            } else {
                quote(column)
            };
            Some(format!(
                "UPDATE {table} SET {col} = {src} WHERE {col} IS NULL AND {} IS NOT NULL",
                quote(column)
            ))
        }
        TenantSource::Existing => None,
    };

    let rows = match statement {
        Some(s) => conn.execute_unprepared(&s).await?.rows_affected(),
        None => 0,
    };
    debug!(table = %plan.table, rows, phase = "backfill", "derived tenant ids");

    let fallback = match &plan.orphans {
        OrphanPolicy::AssignFallback {
            tenant,
            justification,
        } => {
            if count_missing(conn, &plan.table).await? == 0 {
                return Ok((rows > 0).then(|| SchemaChange::Backfilled {
                    table: plan.table.clone(),
                    rows,
                    fallback: 0,
                }));
            }
            let known = sql::count(
                conn,
                "SELECT COUNT(*) FROM tenants WHERE id = $1",
                vec![Value::from(tenant.as_uuid())],
            )
            .await?;
            if known == 0 {
                return Err(MigrateError::InvalidPlan(format!(
                    "fallback tenant {tenant} for '{}' is not registered",
                    plan.table
                )));
            }
            let assigned = sql::exec(
                conn,
                &format!("UPDATE {table} SET {col} = $1 WHERE {col} IS NULL"),
                vec![Value::from(tenant.as_uuid())],
            )
            .await?
            .rows_affected();
            warn!(
                table = %plan.table,
                tenant_id = %tenant,
                rows = assigned,
                justification = %justification,
                "orphan rows assigned to the fallback tenant"
            );
            assigned
        }
        OrphanPolicy::Fail => 0,
    };

    Ok((rows + fallback > 0).then(|| SchemaChange::Backfilled {
        table: plan.table.clone(),
        rows,
        fallback,
    }))
}

/// Phase 4: no row may be left without a tenant.
pub(crate) async fn verify<C>(conn: &C, plan: &TenantColumnPlan) -> Result<(), MigrateError>
where
    C: ConnectionTrait,
{
    let total = count_missing(conn, &plan.table).await?;
    if total == 0 {
        return Ok(());
    }
    let key = quote(&plan.key_column);
    let id_text = if is_pg(conn) {
        format!("CAST({key} AS TEXT)")
    } else {
        format!("CASE WHEN typeof({key}) = 'blob' THEN lower(hex({key})) ELSE CAST({key} AS TEXT) END")
    };
    let rows = sql::fetch_all(
        conn,
        &format!(
            "SELECT {id_text} AS row_id FROM {} WHERE {} IS NULL ORDER BY {key} LIMIT {MAX_REPORTED_ORPHANS}",
            quote(&plan.table),
            quote(TENANT_COLUMN)
        ),
        vec![],
    )
    .await?;
    let row_ids = rows
        .iter()
        .map(|r| r.try_get::<String>("", "row_id").map(|id| readable_id(&id)))
        .collect::<Result<Vec<_>, _>>()?;
    Err(MigrateError::BackfillIncomplete {
        table: plan.table.clone(),
        total,
        row_ids,
    })
}

/// Blob UUIDs come back as 32 hex digits; show them hyphenated.
fn readable_id(raw: &str) -> String {
    if raw.len() == 32 {
        if let Ok(id) = uuid::Uuid::try_parse(raw) {
            return id.to_string();
        }
    }
    raw.to_owned()
}

/// Phase 5: `NOT NULL` plus `fk_<table>_tenant`.
pub(crate) async fn promote<C>(conn: &C, table: &str) -> Result<Vec<SchemaChange>, MigrateError>
where
    C: ConnectionTrait,
{
    let nullable = column_nullable(conn, table, TENANT_COLUMN)
        .await?
        .ok_or_else(|| MigrateError::InvalidPlan(format!("'{table}' has no {TENANT_COLUMN}")))?;
    let has_fk = tenant_fk_exists(conn, table).await?;
    if !nullable && has_fk {
        return Ok(Vec::new());
    }

    if is_pg(conn) {
        if nullable {
            conn.execute_unprepared(&format!(
                "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
                quote(table),
                quote(TENANT_COLUMN)
            ))
            .await?;
        }
        if !has_fk {
            conn.execute_unprepared(&format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES tenants (id)",
                quote(table),
                quote(&fk_name(table)),
                quote(TENANT_COLUMN)
            ))
            .await?;
        }
    } else {
        sqlite_rebuild::rebuild(conn, table, TenantColumn::REQUIRED).await?;
    }

    let mut changes = Vec::new();
    if nullable {
        changes.push(SchemaChange::Promoted {
            table: table.to_owned(),
        });
    }
    if !has_fk {
        changes.push(SchemaChange::ForeignKeyAdded {
            table: table.to_owned(),
            name: fk_name(table),
        });
    }
    Ok(changes)
}

/// Phase 6.
pub(crate) async fn install_policy<C>(
    conn: &C,
    policy: &IsolationPolicy,
) -> Result<Option<SchemaChange>, MigrateError>
where
    C: ConnectionTrait,
{
    match policy::inspect(conn, policy).await? {
        PolicyState::Identical => Ok(None),
        PolicyState::Conflict { existing } => Err(MigrateError::PolicyConflict {
            table: policy.table().to_owned(),
            name: policy.name(),
            existing,
        }),
        PolicyState::Absent => {
            policy::create(conn, policy).await?;
            Ok(Some(SchemaChange::PolicyInstalled {
                table: policy.table().to_owned(),
                name: policy.name(),
            }))
        }
    }
}

/// Phase 7.
pub(crate) async fn create_index<C>(
    conn: &C,
    table: &str,
) -> Result<Option<SchemaChange>, DbErr>
where
    C: ConnectionTrait,
{
    let name = index_name(table);
    if index_exists(conn, &name).await? {
        return Ok(None);
    }
    conn.execute_unprepared(&format!(
        "CREATE INDEX {} ON {} ({})",
        quote(&name),
        quote(table),
        quote(TENANT_COLUMN)
    ))
    .await?;
    Ok(Some(SchemaChange::IndexCreated {
        table: table.to_owned(),
        name,
    }))
}

pub(crate) async fn remove_policy<C>(
    conn: &C,
    policy: &IsolationPolicy,
) -> Result<Option<SchemaChange>, DbErr>
where
    C: ConnectionTrait,
{
    Ok(policy::remove(conn, policy)
        .await?
        .then(|| SchemaChange::PolicyRemoved {
            table: policy.table().to_owned(),
            name: policy.name(),
        }))
}

pub(crate) async fn drop_index<C>(conn: &C, table: &str) -> Result<Option<SchemaChange>, DbErr>
where
    C: ConnectionTrait,
{
    let name = index_name(table);
    if !index_exists(conn, &name).await? {
        return Ok(None);
    }
    conn.execute_unprepared(&format!("DROP INDEX {}", quote(&name)))
        .await?;
    Ok(Some(SchemaChange::IndexDropped {
        table: table.to_owned(),
        name,
    }))
}

/// Reverse of phases 2 and 5.
///
/// `keep` is `None` when the step added the column: it is dropped. Otherwise the
/// column stays and only the constraints it did not have before are removed.
pub(crate) async fn demote<C>(
    conn: &C,
    table: &str,
    keep: Option<TenantColumnState>,
) -> Result<Vec<SchemaChange>, MigrateError>
where
    C: ConnectionTrait,
{
    let Some(nullable) = column_nullable(conn, table, TENANT_COLUMN).await? else {
        return Ok(Vec::new());
    };
    let has_fk = tenant_fk_exists(conn, table).await?;
    let keep_column = keep.is_some();
    let prior = keep.unwrap_or_default();
    let drop_fk = has_fk && !prior.tenant_fk;
    let relax = keep_column && !nullable && !prior.not_null;

    let mut changes = Vec::new();
    if drop_fk {
        changes.push(SchemaChange::ForeignKeyDropped {
            table: table.to_owned(),
            name: fk_name(table),
        });
    }
    if relax {
        changes.push(SchemaChange::NotNullRelaxed {
            table: table.to_owned(),
        });
    }
    if !keep_column {
        changes.push(SchemaChange::ColumnDropped {
            table: table.to_owned(),
            column: TENANT_COLUMN.to_owned(),
        });
    }
    if changes.is_empty() {
        return Ok(changes);
    }

    if is_pg(conn) {
        let t = quote(table);
        if drop_fk {
            conn.execute_unprepared(&format!(
                "ALTER TABLE {t} DROP CONSTRAINT {}",
                quote(&fk_name(table))
            ))
            .await?;
        }
        if !keep_column {
            conn.execute_unprepared(&format!(
                "ALTER TABLE {t} DROP COLUMN {}",
                quote(TENANT_COLUMN)
            ))
            .await?;
        } else if relax {
            conn.execute_unprepared(&format!(
                "ALTER TABLE {t} ALTER COLUMN {} DROP NOT NULL",
                quote(TENANT_COLUMN)
            ))
            .await?;
        }
    } else {
        let target = if keep_column {
            TenantColumn::Present {
                not_null: !nullable && !relax,
                tenant_fk: has_fk && !drop_fk,
            }
        } else {
            TenantColumn::Absent
        };
        sqlite_rebuild::rebuild(conn, table, target).await?;
    }
    Ok(changes)
}
