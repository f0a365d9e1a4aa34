//! Isolation policies: one per isolated table, always `tenant_column = get_current_tenant()`.
//!
//! PostgreSQL policies are native row-level security. Every backend also records the
//! policy in the `tenant_isolation_policies` catalog; on SQLite the catalog is the
//! only record and the Rust predicate is the enforcement.
//!
//! Installing and dropping policies is privileged and only reachable from
//! [`crate::migrate`].

use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr};

use crate::sql::{self, quote};

/// Catalog of installed policies.
pub const POLICY_CATALOG: &str = "tenant_isolation_policies";

/// SQL function every predicate compares against.
pub const CURRENT_TENANT_FN: &str = "get_current_tenant()";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationPolicy {
    table: String,
    tenant_column: String,
}

impl IsolationPolicy {
    #[must_use]
    pub fn new(table: &str, tenant_column: &str) -> Self {
        Self {
            table: table.to_owned(),
            tenant_column: tenant_column.to_owned(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn tenant_column(&self) -> &str {
        &self.tenant_column
    }

    /// `tenant_isolation_<table>`
    #[must_use]
    pub fn name(&self) -> String {
        format!("tenant_isolation_{}", self.table)
    }

    #[must_use]
    pub fn predicate(&self) -> String {
        format!("{} = {CURRENT_TENANT_FN}", self.tenant_column)
    }
}

/// What is currently installed under the policy's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PolicyState {
    Absent,
    Identical,
    Conflict { existing: String },
}

/// Compare predicate texts ignoring case, whitespace, parentheses and casts, so the
/// text PostgreSQL echoes back from `pg_policies` matches what we issued.
pub(crate) fn same_predicate(a: &str, b: &str) -> bool {
    fn normalize(s: &str) -> String {
        s.replace("::uuid", "")
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '(' && *c != ')' && *c != '"')
            .flat_map(char::to_lowercase)
            .collect()
    }
    normalize(a) == normalize(b)
}

/// `[USING, WITH CHECK]` of a `pg_policies` row.
///
/// A `FOR ALL` policy without `WITH CHECK` checks new rows against `USING`, so the
/// missing clause takes the value of `qual`.
fn effective_predicates(qual: Option<String>, with_check: Option<String>) -> Vec<String> {
    let qual = qual.unwrap_or_default();
    let check = with_check.unwrap_or_else(|| qual.clone());
    vec![qual, check]
}

pub(crate) async fn ensure_catalog<C>(conn: &C) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    conn.execute_unprepared(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{POLICY_CATALOG}" (
            policy_name TEXT PRIMARY KEY,
            table_name TEXT NOT NULL,
            tenant_column TEXT NOT NULL,
            predicate TEXT NOT NULL
        )"#
    ))
    .await?;
    Ok(())
}

pub(crate) async fn inspect<C>(conn: &C, policy: &IsolationPolicy) -> Result<PolicyState, DbErr>
where
    C: ConnectionTrait,
{
    let expected = policy.predicate();
    let existing: Vec<String> = match conn.get_database_backend() {
        DatabaseBackend::Postgres => {
            let row = sql::fetch_one(
                conn,
                "SELECT cmd, qual, with_check FROM pg_policies \
                 WHERE schemaname = current_schema() AND tablename = $1 AND policyname = $2",
                vec![policy.table().into(), policy.name().into()],
            )
            .await?;
            match row {
                Some(row) => {
                    let cmd: String = row.try_get("", "cmd")?;
                    let qual: Option<String> = row.try_get("", "qual")?;
                    let check: Option<String> = row.try_get("", "with_check")?;
                    if !cmd.eq_ignore_ascii_case("ALL") {
                        return Ok(PolicyState::Conflict {
                            existing: format!("FOR {cmd} {}", qual.unwrap_or_default()),
                        });
                    }
                    effective_predicates(qual, check)
                }
                None => return Ok(PolicyState::Absent),
            }
        }
        _ => {
            let row = sql::fetch_one(
                conn,
                &format!(r#"SELECT predicate FROM "{POLICY_CATALOG}" WHERE policy_name = $1"#),
                vec![policy.name().into()],
            )
            .await?;
            match row {
                Some(row) => vec![row.try_get::<String>("", "predicate")?],
                None => return Ok(PolicyState::Absent),
            }
        }
    };

    if existing.iter().all(|e| same_predicate(e, &expected)) {
        Ok(PolicyState::Identical)
    } else {
        Ok(PolicyState::Conflict {
            existing: existing.join(" / "),
        })
    }
}

/// Drop-if-exists, then create. Callers check [`inspect`] first.
pub(crate) async fn create<C>(conn: &C, policy: &IsolationPolicy) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let table = quote(policy.table());
    let name = quote(&policy.name());
    if conn.get_database_backend() == DatabaseBackend::Postgres {
        let predicate = policy.predicate();
        conn.execute_unprepared(&format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY"))
            .await?;
        conn.execute_unprepared(&format!("DROP POLICY IF EXISTS {name} ON {table}"))
            .await?;
        conn.execute_unprepared(&format!(
            "CREATE POLICY {name} ON {table} FOR ALL USING ({predicate}) WITH CHECK ({predicate})"
        ))
        .await?;
    }
    sql::exec(
        conn,
        &format!(
            r#"INSERT INTO "{POLICY_CATALOG}" (policy_name, table_name, tenant_column, predicate)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (policy_name) DO UPDATE SET
                   table_name = excluded.table_name,
                   tenant_column = excluded.tenant_column,
                   predicate = excluded.predicate"#
        ),
        vec![
            policy.name().into(),
            policy.table().into(),
            policy.tenant_column().into(),
            policy.predicate().into(),
        ],
    )
    .await?;
    Ok(())
}

/// Remove the policy; returns whether anything was installed.
pub(crate) async fn remove<C>(conn: &C, policy: &IsolationPolicy) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let existed = inspect(conn, policy).await? != PolicyState::Absent;
    if conn.get_database_backend() == DatabaseBackend::Postgres {
        let table = quote(policy.table());
        let name = quote(&policy.name());
        conn.execute_unprepared(&format!("DROP POLICY IF EXISTS {name} ON {table}"))
            .await?;
        conn.execute_unprepared(&format!("ALTER TABLE {table} DISABLE ROW LEVEL SECURITY"))
            .await?;
    }
    sql::exec(
        conn,
        &format!(r#"DELETE FROM "{POLICY_CATALOG}" WHERE policy_name = $1"#),
        vec![policy.name().into()],
    )
    .await?;
    Ok(existed)
}
