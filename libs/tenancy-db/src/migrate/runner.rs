use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, DatabaseTransaction, FromQueryResult,
    Statement, TransactionTrait, Value,
};
use tracing::{debug, info};

use crate::TenancyDb;
use crate::migrate::ddl::TenantColumnState;
use crate::migrate::{
    HISTORY_TABLE, MigrateError, MigrationStep, SchemaChange, StepAction, TENANT_COLUMN,
    TenantColumnPlan, TenantSource, builtin, ddl, graph,
};
use crate::secure::IsolationPolicy;
use crate::secure::policy;
use crate::sql;

/// Key of the transaction-scoped advisory lock taken by every PostgreSQL step.
const ADVISORY_LOCK_KEY: i64 = 0x7465_6e61_6e63_7921;

/// History column with the pre-step state of `Existing` tenant columns, as JSON.
const PRIOR_STATE_COLUMN: &str = "prior_state";

/// Per table, the tenant column constraints that predate the step.
type PriorState = BTreeMap<String, TenantColumnState>;

/// A step that was applied by this run.
#[derive(Debug, Clone)]
pub struct AppliedStep {
    pub sequence_id: i64,
    pub description: String,
    pub changes: Vec<SchemaChange>,
}

#[derive(Debug, Clone, Default)]
pub struct AppliedReport {
    pub applied: Vec<AppliedStep>,
    /// Steps in range that were already recorded.
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct RevertedStep {
    pub sequence_id: i64,
    pub description: String,
    pub changes: Vec<SchemaChange>,
}

#[derive(Debug, Clone, Default)]
pub struct RevertedReport {
    pub reverted: Vec<RevertedStep>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatus {
    pub sequence_id: i64,
    pub description: String,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromQueryResult)]
struct HistoryRow {
    sequence_id: i64,
    description: String,
    applied_at: DateTime<Utc>,
}

/// Applies and reverts [`MigrationStep`]s over the privileged connection.
///
/// # Example
/// ```ignore
/// let orchestrator = Orchestrator::new(&db);
/// let report = orchestrator.apply(&config.steps, None).await?;
/// for step in &report.applied {
///     println!("{} {}", step.sequence_id, step.description);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Orchestrator {
    conn: DatabaseConnection,
}

impl Orchestrator {
    #[must_use]
    pub fn new(db: &TenancyDb) -> Self {
        Self {
            conn: db.privileged().clone(),
        }
    }

    /// Apply every pending step with `sequence_id <= to` (all when `to` is `None`),
    /// in ascending order, one transaction per step.
    ///
    /// # Errors
    /// - `DuplicateSequence` / `InvalidPlan` before anything runs
    /// - `OutOfOrder` when a pending step sorts below the latest applied one
    /// - `Step { sequence_id, .. }` wrapping the failure of one step; earlier steps of
    ///   this run stay applied, the failing one leaves no trace
    pub async fn apply(
        &self,
        steps: &[MigrationStep],
        to: Option<i64>,
    ) -> Result<AppliedReport, MigrateError> {
        let steps = validated(steps)?;
        self.ensure_history().await?;
        let history = self.history().await?;
        let latest = history.keys().next_back().copied();

        let in_range: Vec<&MigrationStep> = steps
            .into_iter()
            .filter(|s| to.is_none_or(|t| s.sequence_id <= t))
            .collect();
        let mut report = AppliedReport::default();
        let mut pending = Vec::new();
        for step in in_range {
            if history.contains_key(&step.sequence_id) {
                debug!(sequence_id = step.sequence_id, "step already applied, skipping");
                report.skipped += 1;
            } else {
                pending.push(step);
            }
        }
        if let (Some(first), Some(latest)) = (pending.first(), latest) {
            if first.sequence_id < latest {
                return Err(MigrateError::OutOfOrder {
                    sequence_id: first.sequence_id,
                    latest_applied: latest,
                });
            }
        }

        for step in pending {
            info!(
                sequence_id = step.sequence_id,
                description = %step.description,
                "applying step"
            );
            match self.apply_one(step).await.map_err(|e| e.in_step(step.sequence_id))? {
                Some(changes) => {
                    info!(
                        sequence_id = step.sequence_id,
                        changes = changes.len(),
                        "step applied"
                    );
                    report.applied.push(AppliedStep {
                        sequence_id: step.sequence_id,
                        description: step.description.clone(),
                        changes,
                    });
                }
                None => report.skipped += 1,
            }
        }
        Ok(report)
    }

    /// `None` when another runner recorded the step first.
    async fn apply_one(&self, step: &MigrationStep) -> Result<Option<Vec<SchemaChange>>, MigrateError> {
        let txn = self.conn.begin().await?;
        let res: Result<Option<Vec<SchemaChange>>, MigrateError> = async {
            if lock_history(&txn).await? && is_recorded(&txn, step.sequence_id).await? {
                debug!(sequence_id = step.sequence_id, "step applied concurrently");
                return Ok(None);
            }
            let mut prior = PriorState::new();
            let changes = forward(&txn, &step.action, &mut prior).await?;
            for change in &changes {
                debug!(sequence_id = step.sequence_id, change = %change, "schema change");
            }
            let prior = if prior.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&prior)?)
            };
            sql::exec(
                &txn,
                &format!(
                    "INSERT INTO {HISTORY_TABLE} \
                     (sequence_id, description, applied_at, {PRIOR_STATE_COLUMN}) \
                     VALUES ($1, $2, $3, $4)"
                ),
                vec![
                    step.sequence_id.into(),
                    step.description.clone().into(),
                    Value::from(Utc::now()),
                    Value::from(prior),
                ],
            )
            .await?;
            Ok(Some(changes))
        }
        .await;
        finish(txn, res).await
    }

    /// Revert the last `n` applied steps, newest first.
    ///
    /// # Errors
    /// `UnknownStep` when an applied step has no definition in `steps`, or
    /// `Step { sequence_id, .. }` wrapping the failure of one step.
    pub async fn revert(
        &self,
        steps: &[MigrationStep],
        n: usize,
    ) -> Result<RevertedReport, MigrateError> {
        let steps = validated(steps)?;
        self.ensure_history().await?;
        let history = self.history().await?;
        let by_id: BTreeMap<i64, &MigrationStep> =
            steps.into_iter().map(|s| (s.sequence_id, s)).collect();

        let mut targets = Vec::new();
        for id in history.keys().rev().take(n) {
            let step = by_id
                .get(id)
                .copied()
                .ok_or(MigrateError::UnknownStep(*id))?;
            targets.push(step);
        }

        let mut report = RevertedReport::default();
        for step in targets {
            info!(
                sequence_id = step.sequence_id,
                description = %step.description,
                "reverting step"
            );
            let changes = self
                .revert_one(step)
                .await
                .map_err(|e| e.in_step(step.sequence_id))?;
            info!(sequence_id = step.sequence_id, changes = changes.len(), "step reverted");
            report.reverted.push(RevertedStep {
                sequence_id: step.sequence_id,
                description: step.description.clone(),
                changes,
            });
        }
        Ok(report)
    }

    async fn revert_one(&self, step: &MigrationStep) -> Result<Vec<SchemaChange>, MigrateError> {
        let txn = self.conn.begin().await?;
        let res: Result<Vec<SchemaChange>, MigrateError> = async {
            lock_history(&txn).await?;
            let prior = recorded_prior_state(&txn, step.sequence_id).await?;
            let changes = reverse(&txn, step, &prior).await?;
            sql::exec(
                &txn,
                &format!("DELETE FROM {HISTORY_TABLE} WHERE sequence_id = $1"),
                vec![step.sequence_id.into()],
            )
            .await?;
            Ok(changes)
        }
        .await;
        finish(txn, res).await
    }

    /// Every defined step plus any recorded step without a definition, by sequence id.
    ///
    /// # Errors
    /// `Db` if the history cannot be read.
    pub async fn status(&self, steps: &[MigrationStep]) -> Result<Vec<StepStatus>, MigrateError> {
        let history = if ddl::table_exists(&self.conn, HISTORY_TABLE).await? {
            self.history().await?
        } else {
            BTreeMap::new()
        };
        let mut out: BTreeMap<i64, StepStatus> = history
            .values()
            .map(|h| {
                (
                    h.sequence_id,
                    StepStatus {
                        sequence_id: h.sequence_id,
                        description: h.description.clone(),
                        applied_at: Some(h.applied_at),
                    },
                )
            })
            .collect();
        for step in steps {
            out.entry(step.sequence_id).or_insert_with(|| StepStatus {
                sequence_id: step.sequence_id,
                description: step.description.clone(),
                applied_at: None,
            });
        }
        Ok(out.into_values().collect())
    }

    async fn ensure_history(&self) -> Result<(), MigrateError> {
        let backend = self.conn.get_database_backend();
        let ts = match backend {
            DatabaseBackend::Postgres => "TIMESTAMPTZ",
            DatabaseBackend::Sqlite => "TEXT",
            DatabaseBackend::MySql => {
                return Err(MigrateError::Unsupported("MySQL backend".to_owned()));
            }
        };
        self.conn
            .execute_unprepared(&format!(
                "CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (
                    sequence_id BIGINT PRIMARY KEY,
                    description TEXT NOT NULL,
                    applied_at {ts} NOT NULL,
                    {PRIOR_STATE_COLUMN} TEXT NULL
                )"
            ))
            .await?;
        // Histories written before the column existed.
        if ddl::column_nullable(&self.conn, HISTORY_TABLE, PRIOR_STATE_COLUMN)
            .await?
            .is_none()
        {
            self.conn
                .execute_unprepared(&format!(
                    "ALTER TABLE {HISTORY_TABLE} ADD COLUMN {PRIOR_STATE_COLUMN} TEXT NULL"
                ))
                .await?;
        }
        Ok(())
    }

    async fn history(&self) -> Result<BTreeMap<i64, HistoryRow>, MigrateError> {
        let backend = self.conn.get_database_backend();
        let rows = HistoryRow::find_by_statement(Statement::from_string(
            backend,
            format!("SELECT sequence_id, description, applied_at FROM {HISTORY_TABLE}"),
        ))
        .all(&self.conn)
        .await?;
        Ok(rows.into_iter().map(|r| (r.sequence_id, r)).collect())
    }
}

/// Sorted by sequence id, unique, structurally valid.
fn validated(steps: &[MigrationStep]) -> Result<Vec<&MigrationStep>, MigrateError> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.sequence_id) {
            return Err(MigrateError::DuplicateSequence(step.sequence_id));
        }
        step.validate().map_err(|e| e.in_step(step.sequence_id))?;
    }
    let mut sorted: Vec<&MigrationStep> = steps.iter().collect();
    sorted.sort_by_key(|s| s.sequence_id);
    Ok(sorted)
}

/// Serialize runners on PostgreSQL. Returns whether a lock was taken.
async fn lock_history(txn: &DatabaseTransaction) -> Result<bool, MigrateError> {
    if txn.get_database_backend() != DatabaseBackend::Postgres {
        return Ok(false);
    }
    sql::exec(txn, "SELECT pg_advisory_xact_lock($1)", vec![ADVISORY_LOCK_KEY.into()]).await?;
    Ok(true)
}

async fn is_recorded(txn: &DatabaseTransaction, sequence_id: i64) -> Result<bool, MigrateError> {
    let n = sql::count(
        txn,
        &format!("SELECT COUNT(*) FROM {HISTORY_TABLE} WHERE sequence_id = $1"),
        vec![sequence_id.into()],
    )
    .await?;
    Ok(n > 0)
}

async fn recorded_prior_state(
    txn: &DatabaseTransaction,
    sequence_id: i64,
) -> Result<PriorState, MigrateError> {
    let row = sql::fetch_one(
        txn,
        &format!("SELECT {PRIOR_STATE_COLUMN} FROM {HISTORY_TABLE} WHERE sequence_id = $1"),
        vec![sequence_id.into()],
    )
    .await?;
    let raw: Option<String> = match row {
        Some(row) => row.try_get("", PRIOR_STATE_COLUMN)?,
        None => None,
    };
    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(PriorState::new()),
    }
}

async fn finish<T>(txn: DatabaseTransaction, res: Result<T, MigrateError>) -> Result<T, MigrateError> {
    match res {
        Ok(v) => {
            txn.commit().await?;
            Ok(v)
        }
        Err(e) => {
            _ = txn.rollback().await;
            Err(e)
        }
    }
}

async fn forward(
    txn: &DatabaseTransaction,
    action: &StepAction,
    prior: &mut PriorState,
) -> Result<Vec<SchemaChange>, MigrateError> {
    match action {
        StepAction::TenantRegistry => builtin::create_registry(txn).await,
        StepAction::AuditLog => builtin::create_audit_log(txn).await,
        StepAction::Sql { forward, .. } => Ok(builtin::run_statements(txn, forward).await?),
        StepAction::IsolateTables { tables } => isolate(txn, tables, prior).await,
    }
}

async fn reverse(
    txn: &DatabaseTransaction,
    step: &MigrationStep,
    prior: &PriorState,
) -> Result<Vec<SchemaChange>, MigrateError> {
    match &step.action {
        StepAction::TenantRegistry => builtin::drop_registry(txn).await,
        StepAction::AuditLog => builtin::drop_audit_log(txn).await,
        StepAction::Sql { reverse, .. } => {
            if reverse.iter().all(|s| s.trim().is_empty()) {
                return Err(MigrateError::Unsupported(format!(
                    "step {} has no reverse statements",
                    step.sequence_id
                )));
            }
            Ok(builtin::run_statements(txn, reverse).await?)
        }
        StepAction::IsolateTables { tables } => deisolate(txn, tables, prior).await,
    }
}

async fn isolate(
    txn: &DatabaseTransaction,
    tables: &[TenantColumnPlan],
    prior: &mut PriorState,
) -> Result<Vec<SchemaChange>, MigrateError> {
    ddl::require_table(txn, "tenants").await?;
    policy::ensure_catalog(txn).await?;

    let mut changes = Vec::new();
    for plan in graph::backfill_order(tables)? {
        let table = plan.table.as_str();
        ddl::require_table(txn, table).await?;

        debug!(table, phase = "lock", "isolating table");
        ddl::lock_table(txn, table).await?;

        debug!(table, phase = "add_column", "isolating table");
        if plan.source == TenantSource::Existing {
            let Some(state) = ddl::tenant_column_state(txn, table).await? else {
                return Err(MigrateError::InvalidPlan(format!(
                    "'{table}' is declared with an existing {TENANT_COLUMN} but has none"
                )));
            };
            prior.insert(table.to_owned(), state);
        }
        changes.extend(ddl::add_tenant_column(txn, table).await?);

        debug!(table, phase = "backfill", "isolating table");
        changes.extend(ddl::backfill(txn, plan).await?);

        debug!(table, phase = "verify", "isolating table");
        ddl::verify(txn, plan).await?;

        debug!(table, phase = "promote", "isolating table");
        changes.extend(ddl::promote(txn, table).await?);

        debug!(table, phase = "policy", "isolating table");
        changes.extend(ddl::install_policy(txn, &IsolationPolicy::new(table, TENANT_COLUMN)).await?);

        debug!(table, phase = "index", "isolating table");
        changes.extend(ddl::create_index(txn, table).await?);
    }
    Ok(changes)
}

/// Without a recorded prior state an `Existing` column is left nullable and
/// without the tenant FK.
async fn deisolate(
    txn: &DatabaseTransaction,
    tables: &[TenantColumnPlan],
    prior: &PriorState,
) -> Result<Vec<SchemaChange>, MigrateError> {
    policy::ensure_catalog(txn).await?;
    let mut changes = Vec::new();
    for plan in graph::backfill_order(tables)?.into_iter().rev() {
        let table = plan.table.as_str();
        if !ddl::table_exists(txn, table).await? {
            continue;
        }
        debug!(table, "removing isolation");
        changes.extend(ddl::remove_policy(txn, &IsolationPolicy::new(table, TENANT_COLUMN)).await?);
        changes.extend(ddl::drop_index(txn, table).await?);
        let keep = (plan.source == TenantSource::Existing)
            .then(|| prior.get(table).copied().unwrap_or_default());
        changes.extend(ddl::demote(txn, table, keep).await?);
    }
    Ok(changes)
}
