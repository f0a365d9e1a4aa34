//! Small helpers for the hand-written DDL issued by policies and the orchestrator.

use sea_orm::{ConnectionTrait, DbErr, ExecResult, QueryResult, Statement, Value};

/// Identifiers are interpolated into DDL, so only plain names are accepted.
pub(crate) fn is_valid_ident(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

pub(crate) async fn exec<C>(conn: &C, sql: &str, values: Vec<Value>) -> Result<ExecResult, DbErr>
where
    C: ConnectionTrait,
{
    let backend = conn.get_database_backend();
    conn.execute(Statement::from_sql_and_values(backend, sql, values))
        .await
}

pub(crate) async fn fetch_one<C>(
    conn: &C,
    sql: &str,
    values: Vec<Value>,
) -> Result<Option<QueryResult>, DbErr>
where
    C: ConnectionTrait,
{
    let backend = conn.get_database_backend();
    conn.query_one(Statement::from_sql_and_values(backend, sql, values))
        .await
}

pub(crate) async fn fetch_all<C>(
    conn: &C,
    sql: &str,
    values: Vec<Value>,
) -> Result<Vec<QueryResult>, DbErr>
where
    C: ConnectionTrait,
{
    let backend = conn.get_database_backend();
    conn.query_all(Statement::from_sql_and_values(backend, sql, values))
        .await
}

/// `SELECT COUNT(*) ...` helper; a missing row counts as zero.
pub(crate) async fn count<C>(conn: &C, sql: &str, values: Vec<Value>) -> Result<i64, DbErr>
where
    C: ConnectionTrait,
{
    match fetch_one(conn, sql, values).await? {
        Some(row) => row.try_get_by_index::<i64>(0),
        None => Ok(0),
    }
}
