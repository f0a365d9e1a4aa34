//! The two fixed steps every deployment starts with: the tenant registry and the
//! audit log. Both are created already isolated.

use sea_orm::{ConnectionTrait, DbErr};

use crate::migrate::ddl::{self, is_pg};
use crate::migrate::{MigrateError, SchemaChange, TENANT_COLUMN, fk_name};
use crate::secure::policy;
use crate::secure::{IsolationPolicy, TENANT_SETTING};
use crate::sql::{self, quote};

const TENANTS: &str = "tenants";
const AUDIT_LOGS: &str = "audit_logs";
const AUDIT_TIME_INDEX: &str = "idx_audit_logs_tenant_occurred";
const AUDIT_GUARD: &str = "audit_logs_append_only";

async fn create_table<C>(conn: &C, table: &str, ddl_sql: &str) -> Result<Option<SchemaChange>, DbErr>
where
    C: ConnectionTrait,
{
    if ddl::table_exists(conn, table).await? {
        return Ok(None);
    }
    conn.execute_unprepared(ddl_sql).await?;
    Ok(Some(SchemaChange::TableCreated {
        table: table.to_owned(),
    }))
}

async fn drop_table<C>(conn: &C, table: &str) -> Result<Option<SchemaChange>, DbErr>
where
    C: ConnectionTrait,
{
    if !ddl::table_exists(conn, table).await? {
        return Ok(None);
    }
    conn.execute_unprepared(&format!("DROP TABLE {}", quote(table)))
        .await?;
    Ok(Some(SchemaChange::TableDropped {
        table: table.to_owned(),
    }))
}

async fn function_exists<C>(conn: &C, name: &str) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    Ok(sql::count(
        conn,
        "SELECT COUNT(*) FROM pg_proc WHERE proname = $1 \
         AND pronamespace = current_schema()::text::regnamespace",
        vec![name.into()],
    )
    .await?
        > 0)
}

/// `(name, definition)` of the PostgreSQL helpers the policies call.
fn tenant_functions() -> [(&'static str, String); 2] {
    [
        (
            "get_current_tenant",
            format!(
                "CREATE OR REPLACE FUNCTION get_current_tenant() RETURNS UUID \
                 LANGUAGE sql STABLE AS \
                 $$ SELECT NULLIF(current_setting('{TENANT_SETTING}', true), '')::uuid $$"
            ),
        ),
        (
            "set_current_tenant",
            format!(
                "CREATE OR REPLACE FUNCTION set_current_tenant(tenant UUID) RETURNS VOID \
                 LANGUAGE plpgsql AS \
                 $$ BEGIN PERFORM set_config('{TENANT_SETTING}', tenant::text, true); END $$"
            ),
        ),
    ]
}

pub(crate) async fn create_registry<C>(conn: &C) -> Result<Vec<SchemaChange>, MigrateError>
where
    C: ConnectionTrait,
{
    let mut changes = Vec::new();
    let table_sql = if is_pg(conn) {
        "CREATE TABLE tenants (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )"
    } else {
        "CREATE TABLE tenants (
            id BLOB PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )"
    };
    changes.extend(create_table(conn, TENANTS, table_sql).await?);

    if is_pg(conn) {
        for (name, definition) in tenant_functions() {
            if !function_exists(conn, name).await? {
                conn.execute_unprepared(&definition).await?;
                changes.push(SchemaChange::FunctionCreated {
                    name: name.to_owned(),
                });
            }
        }
    }

    policy::ensure_catalog(conn).await?;
    changes.extend(ddl::install_policy(conn, &IsolationPolicy::new(TENANTS, "id")).await?);
    Ok(changes)
}

pub(crate) async fn drop_registry<C>(conn: &C) -> Result<Vec<SchemaChange>, MigrateError>
where
    C: ConnectionTrait,
{
    let mut changes = Vec::new();
    if ddl::table_exists(conn, policy::POLICY_CATALOG).await? {
        changes.extend(ddl::remove_policy(conn, &IsolationPolicy::new(TENANTS, "id")).await?);
    }
    changes.extend(drop_table(conn, TENANTS).await?);
    if is_pg(conn) {
        for (name, _) in tenant_functions() {
            if function_exists(conn, name).await? {
                conn.execute_unprepared(&format!("DROP FUNCTION {name}"))
                    .await?;
                changes.push(SchemaChange::FunctionDropped {
                    name: name.to_owned(),
                });
            }
        }
    }
    Ok(changes)
}

pub(crate) async fn create_audit_log<C>(conn: &C) -> Result<Vec<SchemaChange>, MigrateError>
where
    C: ConnectionTrait,
{
    ddl::require_table(conn, TENANTS).await?;
    let (uuid, ts, json) = if is_pg(conn) {
        ("UUID", "TIMESTAMPTZ", "JSONB")
    } else {
        ("BLOB", "TEXT", "TEXT")
    };
    let table_sql = format!(
        "CREATE TABLE {AUDIT_LOGS} (
            id {uuid} PRIMARY KEY NOT NULL,
            {TENANT_COLUMN} {uuid} NOT NULL,
            actor_id {uuid} NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            before_state {json} NULL,
            after_state {json} NULL,
            occurred_at {ts} NOT NULL,
            CONSTRAINT {fk} FOREIGN KEY ({TENANT_COLUMN}) REFERENCES tenants (id)
        )",
        fk = quote(&fk_name(AUDIT_LOGS)),
    );

    let mut changes = Vec::new();
    changes.extend(create_table(conn, AUDIT_LOGS, &table_sql).await?);
    changes.extend(ddl::create_index(conn, AUDIT_LOGS).await?);
    if !ddl::index_exists(conn, AUDIT_TIME_INDEX).await? {
        conn.execute_unprepared(&format!(
            "CREATE INDEX {AUDIT_TIME_INDEX} ON {AUDIT_LOGS} ({TENANT_COLUMN}, occurred_at)"
        ))
        .await?;
        changes.push(SchemaChange::IndexCreated {
            table: AUDIT_LOGS.to_owned(),
            name: AUDIT_TIME_INDEX.to_owned(),
        });
    }
    changes.extend(create_append_only_guard(conn).await?);
    policy::ensure_catalog(conn).await?;
    changes.extend(
        ddl::install_policy(conn, &IsolationPolicy::new(AUDIT_LOGS, TENANT_COLUMN)).await?,
    );
    Ok(changes)
}

async fn trigger_exists<C>(conn: &C, name: &str) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let query = if is_pg(conn) {
        "SELECT COUNT(*) FROM pg_trigger WHERE tgname = $1"
    } else {
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name = $1"
    };
    Ok(sql::count(conn, query, vec![name.into()]).await? > 0)
}

/// Refuse `UPDATE` and `DELETE` on `audit_logs` for every role, owner included.
/// The triggers go away with the table.
async fn create_append_only_guard<C>(conn: &C) -> Result<Vec<SchemaChange>, DbErr>
where
    C: ConnectionTrait,
{
    let probe = if is_pg(conn) {
        AUDIT_GUARD.to_owned()
    } else {
        format!("{AUDIT_GUARD}_delete")
    };
    if trigger_exists(conn, &probe).await? {
        return Ok(Vec::new());
    }
    let mut changes = Vec::new();
    if is_pg(conn) {
        conn.execute_unprepared(&format!(
            "CREATE OR REPLACE FUNCTION {AUDIT_GUARD}() RETURNS trigger LANGUAGE plpgsql AS \
             $$ BEGIN RAISE EXCEPTION '{AUDIT_LOGS} is append-only'; END $$"
        ))
        .await?;
        changes.push(SchemaChange::FunctionCreated {
            name: AUDIT_GUARD.to_owned(),
        });
        conn.execute_unprepared(&format!(
            "CREATE TRIGGER {AUDIT_GUARD} BEFORE UPDATE OR DELETE ON {AUDIT_LOGS} \
             FOR EACH ROW EXECUTE FUNCTION {AUDIT_GUARD}()"
        ))
        .await?;
        changes.push(SchemaChange::TriggerCreated {
            table: AUDIT_LOGS.to_owned(),
            name: AUDIT_GUARD.to_owned(),
        });
    } else {
        for op in ["update", "delete"] {
            let name = format!("{AUDIT_GUARD}_{op}");
            conn.execute_unprepared(&format!(
                "CREATE TRIGGER {name} BEFORE {op} ON {AUDIT_LOGS} \
                 BEGIN SELECT RAISE(ABORT, '{AUDIT_LOGS} is append-only'); END"
            ))
            .await?;
            changes.push(SchemaChange::TriggerCreated {
                table: AUDIT_LOGS.to_owned(),
                name,
            });
        }
    }
    Ok(changes)
}

pub(crate) async fn drop_audit_log<C>(conn: &C) -> Result<Vec<SchemaChange>, MigrateError>
where
    C: ConnectionTrait,
{
    let mut changes = Vec::new();
    if ddl::table_exists(conn, policy::POLICY_CATALOG).await? {
        changes.extend(
            ddl::remove_policy(conn, &IsolationPolicy::new(AUDIT_LOGS, TENANT_COLUMN)).await?,
        );
    }
    changes.extend(drop_table(conn, AUDIT_LOGS).await?);
    if is_pg(conn) && function_exists(conn, AUDIT_GUARD).await? {
        conn.execute_unprepared(&format!("DROP FUNCTION {AUDIT_GUARD}()"))
            .await?;
        changes.push(SchemaChange::FunctionDropped {
            name: AUDIT_GUARD.to_owned(),
        });
    }
    Ok(changes)
}

/// Raw statements, executed in order. Blank entries are skipped.
pub(crate) async fn run_statements<C>(conn: &C, statements: &[String]) -> Result<Vec<SchemaChange>, DbErr>
where
    C: ConnectionTrait,
{
    let mut n = 0;
    for s in statements.iter().filter(|s| !s.trim().is_empty()) {
        conn.execute_unprepared(s).await?;
        n += 1;
    }
    Ok(if n > 0 {
        vec![SchemaChange::Executed { statements: n }]
    } else {
        Vec::new()
    })
}
