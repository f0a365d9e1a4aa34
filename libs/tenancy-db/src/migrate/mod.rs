//! Schema evolution orchestrator.
//!
//! Retrofits tenant isolation onto live tables through data-driven
//! [`MigrationStep`] records. Every step runs in one transaction together with its
//! `schema_migrations` row, and every phase checks the current schema before
//! touching it, so re-running a step that is already in place changes nothing.
//!
//! For each table of an [`StepAction::IsolateTables`] step, in backfill-graph order:
//! lock, add `tenant_id` nullable, backfill, verify, promote to `NOT NULL` with a
//! foreign key to `tenants`, install the isolation policy, build the index.

mod builtin;
mod ddl;
mod graph;
mod runner;
mod sqlite_rebuild;
mod step;

use std::fmt;

use sea_orm::DbErr;
use thiserror::Error;

pub use runner::{AppliedReport, AppliedStep, Orchestrator, RevertedReport, RevertedStep, StepStatus};
pub use step::{MigrationStep, OrphanPolicy, StepAction, TenantColumnPlan, TenantSource};

/// Column added to every isolated table.
pub const TENANT_COLUMN: &str = "tenant_id";

/// History table written by the orchestrator.
pub const HISTORY_TABLE: &str = "schema_migrations";

/// Row ids listed in a [`MigrateError::BackfillIncomplete`] report.
pub const MAX_REPORTED_ORPHANS: usize = 100;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("backfill of '{table}' incomplete: {total} rows without a tenant (ids: {})", row_ids.join(", "))]
    BackfillIncomplete {
        table: String,
        total: i64,
        /// At most [`MAX_REPORTED_ORPHANS`] ids, rendered as text.
        row_ids: Vec<String>,
    },

    #[error("policy '{name}' on '{table}' already exists with a different predicate: {existing}")]
    PolicyConflict {
        table: String,
        name: String,
        existing: String,
    },

    #[error("backfill dependencies form a cycle through {}", tables.join(", "))]
    BackfillCycle { tables: Vec<String> },

    #[error("sequence id {0} is defined more than once")]
    DuplicateSequence(i64),

    #[error("step {sequence_id} is pending but step {latest_applied} is already applied")]
    OutOfOrder {
        sequence_id: i64,
        latest_applied: i64,
    },

    #[error("step {0} is applied but has no definition")]
    UnknownStep(i64),

    #[error("table '{0}' does not exist")]
    MissingTable(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("step {sequence_id} failed: {source}")]
    Step {
        sequence_id: i64,
        #[source]
        source: Box<MigrateError>,
    },

    #[error("unreadable step history: {0}")]
    History(#[from] serde_json::Error),

    #[error(transparent)]
    Db(#[from] DbErr),
}

impl MigrateError {
    pub(crate) fn in_step(self, sequence_id: i64) -> Self {
        match self {
            e @ Self::Step { .. } => e,
            e => Self::Step {
                sequence_id,
                source: Box::new(e),
            },
        }
    }
}

/// One schema change actually performed. Phases that found their target state
/// already in place report nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    TableCreated { table: String },
    TableDropped { table: String },
    ColumnAdded { table: String, column: String },
    ColumnDropped { table: String, column: String },
    Backfilled { table: String, rows: u64, fallback: u64 },
    Promoted { table: String },
    NotNullRelaxed { table: String },
    ForeignKeyAdded { table: String, name: String },
    ForeignKeyDropped { table: String, name: String },
    PolicyInstalled { table: String, name: String },
    PolicyRemoved { table: String, name: String },
    IndexCreated { table: String, name: String },
    IndexDropped { table: String, name: String },
    FunctionCreated { name: String },
    FunctionDropped { name: String },
    TriggerCreated { table: String, name: String },
    Executed { statements: usize },
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableCreated { table } => write!(f, "created table {table}"),
            Self::TableDropped { table } => write!(f, "dropped table {table}"),
            Self::ColumnAdded { table, column } => write!(f, "added column {table}.{column}"),
            Self::ColumnDropped { table, column } => write!(f, "dropped column {table}.{column}"),
            Self::Backfilled {
                table,
                rows,
                fallback,
            } => {
                write!(f, "backfilled {rows} rows of {table}")?;
                if *fallback > 0 {
                    write!(f, " ({fallback} assigned to the fallback tenant)")?;
                }
                Ok(())
            }
            Self::Promoted { table } => write!(f, "set {table}.{TENANT_COLUMN} NOT NULL"),
            Self::NotNullRelaxed { table } => write!(f, "made {table}.{TENANT_COLUMN} nullable"),
            Self::ForeignKeyAdded { table, name } => write!(f, "added foreign key {name} on {table}"),
            Self::ForeignKeyDropped { table, name } => {
                write!(f, "dropped foreign key {name} on {table}")
            }
            Self::PolicyInstalled { table, name } => write!(f, "installed policy {name} on {table}"),
            Self::PolicyRemoved { table, name } => write!(f, "removed policy {name} on {table}"),
            Self::IndexCreated { table, name } => write!(f, "created index {name} on {table}"),
            Self::IndexDropped { table, name } => write!(f, "dropped index {name} on {table}"),
            Self::FunctionCreated { name } => write!(f, "created function {name}"),
            Self::FunctionDropped { name } => write!(f, "dropped function {name}"),
            Self::TriggerCreated { table, name } => write!(f, "created trigger {name} on {table}"),
            Self::Executed { statements } => write!(f, "executed {statements} statements"),
        }
    }
}

pub(crate) fn fk_name(table: &str) -> String {
    format!("fk_{table}_tenant")
}

pub(crate) fn index_name(table: &str) -> String {
    format!("idx_{table}_{TENANT_COLUMN}")
}
