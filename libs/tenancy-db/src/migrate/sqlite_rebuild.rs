//! SQLite table rebuild.
//!
//! SQLite cannot add `NOT NULL` or a foreign key to an existing column, nor drop a
//! column that carries one, so the tenant column is changed by recreating the table:
//! copy the rows aside, drop, create with the new definition, copy back, and restore
//! indexes and triggers. Columns, the primary key, unique constraints and the other
//! foreign keys are carried over from the catalog pragmas.
//!
//! Foreign keys are deferred for the rest of the transaction. Dropping a table that
//! other tables reference counts their rows as violations, and re-inserting the
//! parent rows clears them again before commit.

use sea_orm::{ConnectionTrait, DbErr, QueryResult};
use tracing::debug;

use crate::migrate::{MigrateError, TENANT_COLUMN, fk_name};
use crate::sql::{self, quote};

const BACKUP_TABLE: &str = "__tenancy_rebuild_backup";

/// Target shape of the tenant column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TenantColumn {
    Present { not_null: bool, tenant_fk: bool },
    Absent,
}

impl TenantColumn {
    /// `NOT NULL` with `fk_<table>_tenant`.
    pub(crate) const REQUIRED: Self = Self::Present {
        not_null: true,
        tenant_fk: true,
    };
    /// Nullable, no tenant foreign key.
    pub(crate) const OPTIONAL: Self = Self::Present {
        not_null: false,
        tenant_fk: false,
    };

    fn not_null(self) -> bool {
        matches!(self, Self::Present { not_null: true, .. })
    }

    fn tenant_fk(self) -> bool {
        matches!(self, Self::Present { tenant_fk: true, .. })
    }
}

#[derive(Debug)]
struct Column {
    name: String,
    ty: String,
    not_null: bool,
    default: Option<String>,
    pk: i64,
}

#[derive(Debug)]
struct ForeignKey {
    parent: String,
    from: Vec<String>,
    to: Vec<Option<String>>,
    on_update: String,
    on_delete: String,
}

impl ForeignKey {
    fn is_tenant_fk(&self) -> bool {
        self.from.len() == 1 && self.from[0] == TENANT_COLUMN && self.parent.eq_ignore_ascii_case("tenants")
    }
}

pub(crate) async fn rebuild<C>(conn: &C, table: &str, target: TenantColumn) -> Result<(), MigrateError>
where
    C: ConnectionTrait,
{
    let create_sql = sql::fetch_one(
        conn,
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = $1",
        vec![table.into()],
    )
    .await?
    .map(|r| r.try_get::<String>("", "sql"))
    .transpose()?
    .ok_or_else(|| MigrateError::MissingTable(table.to_owned()))?;

    if has_keyword(&create_sql, "CHECK") || has_keyword(&create_sql, "GENERATED") {
        return Err(MigrateError::Unsupported(format!(
            "rebuilding '{table}' would lose its CHECK or generated columns"
        )));
    }
    ensure_no_cascading_children(conn, table).await?;

    let columns = load_columns(conn, table).await?;
    let foreign_keys = load_foreign_keys(conn, table).await?;
    let uniques = load_uniques(conn, table).await?;
    let dependents = load_dependents(conn, table, target).await?;

    let definition = render_create(
        table,
        &columns,
        &foreign_keys,
        &uniques,
        target,
        has_keyword(&create_sql, "AUTOINCREMENT"),
        table_options(&create_sql),
    );
    let kept: Vec<String> = columns
        .iter()
        .filter(|c| target != TenantColumn::Absent || c.name != TENANT_COLUMN)
        .map(|c| quote(&c.name))
        .collect();
    let kept = kept.join(", ");
    let t = quote(table);
    let backup = quote(BACKUP_TABLE);

    debug!(table, target = ?target, phase = "rebuild", "rebuilding sqlite table");
    for statement in [
        "PRAGMA defer_foreign_keys = ON".to_owned(),
        format!("DROP TABLE IF EXISTS {backup}"),
        format!("CREATE TABLE {backup} AS SELECT * FROM {t}"),
        format!("DROP TABLE {t}"),
        definition,
        format!("INSERT INTO {t} ({kept}) SELECT {kept} FROM {backup}"),
        format!("DROP TABLE {backup}"),
    ] {
        conn.execute_unprepared(&statement).await?;
    }
    for statement in &dependents {
        conn.execute_unprepared(statement).await?;
    }

    let violations = sql::count(
        conn,
        "SELECT COUNT(*) FROM pragma_foreign_key_check($1)",
        vec![table.into()],
    )
    .await?;
    if violations > 0 {
        return Err(MigrateError::InvalidPlan(format!(
            "'{table}' has {violations} rows violating its foreign keys"
        )));
    }
    Ok(())
}

/// Whole-word, case-insensitive keyword search over a `CREATE TABLE` statement.
fn has_keyword(sql: &str, keyword: &str) -> bool {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|w| w.eq_ignore_ascii_case(keyword))
}

/// Table options after the closing parenthesis, e.g. `WITHOUT ROWID` or `STRICT`.
fn table_options(sql: &str) -> &str {
    sql.rfind(')').map_or("", |i| sql[i + 1..].trim())
}

/// Dropping the table runs an implicit `DELETE`, which would fire cascading actions.
async fn ensure_no_cascading_children<C>(conn: &C, table: &str) -> Result<(), MigrateError>
where
    C: ConnectionTrait,
{
    let n = sql::count(
        conn,
        r#"SELECT COUNT(*) FROM sqlite_master m, pragma_foreign_key_list(m.name) f
           WHERE m.type = 'table' AND m.name <> $1
             AND lower(f."table") = lower($1) AND f.on_delete <> 'NO ACTION'"#,
        vec![table.into()],
    )
    .await?;
    if n > 0 {
        return Err(MigrateError::Unsupported(format!(
            "'{table}' is referenced with ON DELETE actions and cannot be rebuilt"
        )));
    }
    Ok(())
}

fn text(row: &QueryResult, col: &str) -> Result<String, DbErr> {
    row.try_get::<String>("", col)
}

async fn load_columns<C>(conn: &C, table: &str) -> Result<Vec<Column>, DbErr>
where
    C: ConnectionTrait,
{
    let rows = sql::fetch_all(
        conn,
        r#"SELECT name, type AS ty, "notnull" AS not_null, dflt_value, pk
           FROM pragma_table_info($1) ORDER BY cid"#,
        vec![table.into()],
    )
    .await?;
    rows.iter()
        .map(|r| {
            Ok(Column {
                name: text(r, "name")?,
                ty: text(r, "ty")?,
                not_null: r.try_get::<i64>("", "not_null")? != 0,
                default: r.try_get::<Option<String>>("", "dflt_value")?,
                pk: r.try_get::<i64>("", "pk")?,
            })
        })
        .collect()
}

async fn load_foreign_keys<C>(conn: &C, table: &str) -> Result<Vec<ForeignKey>, DbErr>
where
    C: ConnectionTrait,
{
    let rows = sql::fetch_all(
        conn,
        r#"SELECT id, "table" AS parent, "from" AS child_col, "to" AS parent_col, on_update, on_delete
           FROM pragma_foreign_key_list($1) ORDER BY id, seq"#,
        vec![table.into()],
    )
    .await?;
    let mut keys: Vec<(i64, ForeignKey)> = Vec::new();
    for r in &rows {
        let id = r.try_get::<i64>("", "id")?;
        let from = text(r, "child_col")?;
        let to = r.try_get::<Option<String>>("", "parent_col")?;
        match keys.last_mut() {
            Some((last, fk)) if *last == id => {
                fk.from.push(from);
                fk.to.push(to);
            }
            _ => keys.push((
                id,
                ForeignKey {
                    parent: text(r, "parent")?,
                    from: vec![from],
                    to: vec![to],
                    on_update: text(r, "on_update")?,
                    on_delete: text(r, "on_delete")?,
                },
            )),
        }
    }
    Ok(keys.into_iter().map(|(_, fk)| fk).collect())
}

async fn load_uniques<C>(conn: &C, table: &str) -> Result<Vec<Vec<String>>, DbErr>
where
    C: ConnectionTrait,
{
    let indexes = sql::fetch_all(
        conn,
        "SELECT name FROM pragma_index_list($1) WHERE origin = 'u' ORDER BY seq",
        vec![table.into()],
    )
    .await?;
    let mut uniques = Vec::with_capacity(indexes.len());
    for idx in &indexes {
        let cols = sql::fetch_all(
            conn,
            "SELECT name FROM pragma_index_info($1) ORDER BY seqno",
            vec![text(idx, "name")?.into()],
        )
        .await?;
        uniques.push(cols.iter().map(|c| text(c, "name")).collect::<Result<_, _>>()?);
    }
    Ok(uniques)
}

/// `CREATE INDEX` and `CREATE TRIGGER` statements to replay after the rebuild.
/// Indexes over a dropped tenant column are left out.
async fn load_dependents<C>(conn: &C, table: &str, target: TenantColumn) -> Result<Vec<String>, DbErr>
where
    C: ConnectionTrait,
{
    let rows = sql::fetch_all(
        conn,
        "SELECT type AS kind, name, sql FROM sqlite_master \
         WHERE tbl_name = $1 AND type IN ('index', 'trigger') AND sql IS NOT NULL \
         ORDER BY type, name",
        vec![table.into()],
    )
    .await?;
    let mut out = Vec::with_capacity(rows.len());
    for r in &rows {
        if target == TenantColumn::Absent && text(r, "kind")? == "index" {
            let covers_tenant = sql::count(
                conn,
                "SELECT COUNT(*) FROM pragma_index_info($1) WHERE name = $2",
                vec![text(r, "name")?.into(), TENANT_COLUMN.into()],
            )
            .await?;
            if covers_tenant > 0 {
                continue;
            }
        }
        out.push(text(r, "sql")?);
    }
    Ok(out)
}

fn render_create(
    table: &str,
    columns: &[Column],
    foreign_keys: &[ForeignKey],
    uniques: &[Vec<String>],
    target: TenantColumn,
    autoincrement: bool,
    options: &str,
) -> String {
    let mut pk: Vec<&Column> = columns.iter().filter(|c| c.pk > 0).collect();
    pk.sort_by_key(|c| c.pk);
    let inline_pk = autoincrement && pk.len() == 1;

    let mut parts = Vec::new();
    for c in columns {
        let is_tenant = c.name == TENANT_COLUMN;
        if is_tenant && target == TenantColumn::Absent {
            continue;
        }
        let mut def = vec![quote(&c.name)];
        if !c.ty.is_empty() {
            def.push(c.ty.clone());
        }
        if inline_pk && c.pk > 0 {
            def.push("PRIMARY KEY AUTOINCREMENT".to_owned());
        }
        let not_null = if is_tenant {
            target.not_null()
        } else {
            c.not_null
        };
        if not_null {
            def.push("NOT NULL".to_owned());
        }
        if let Some(d) = &c.default {
            def.push(format!("DEFAULT ({d})"));
        }
        parts.push(def.join(" "));
    }

    if !pk.is_empty() && !inline_pk {
        let cols: Vec<String> = pk.iter().map(|c| quote(&c.name)).collect();
        parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
    }

    let drops_tenant = |cols: &[String]| target == TenantColumn::Absent && cols.iter().any(|c| c == TENANT_COLUMN);
    for u in uniques.iter().filter(|u| !drops_tenant(u)) {
        let cols: Vec<String> = u.iter().map(|c| quote(c)).collect();
        parts.push(format!("UNIQUE ({})", cols.join(", ")));
    }

    for fk in foreign_keys
        .iter()
        .filter(|fk| !fk.is_tenant_fk() && !drops_tenant(&fk.from))
    {
        let from: Vec<String> = fk.from.iter().map(|c| quote(c)).collect();
        let mut def = vec![format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            from.join(", "),
            quote(&fk.parent)
        )];
        if fk.to.iter().all(Option::is_some) {
            let to: Vec<String> = fk.to.iter().flatten().map(|c| quote(c)).collect();
            def.push(format!("({})", to.join(", ")));
        }
        if fk.on_update != "NO ACTION" {
            def.push(format!("ON UPDATE {}", fk.on_update));
        }
        if fk.on_delete != "NO ACTION" {
            def.push(format!("ON DELETE {}", fk.on_delete));
        }
        parts.push(def.join(" "));
    }

    if target.tenant_fk() {
        parts.push(format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES tenants (id)",
            quote(&fk_name(table)),
            quote(TENANT_COLUMN)
        ));
    }

    let mut out = format!("CREATE TABLE {} (\n    {}\n)", quote(table), parts.join(",\n    "));
    if !options.is_empty() {
        out.push(' ');
        out.push_str(options);
    }
    out
}
