//! Data-driven step records consumed by the orchestrator.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tenancy_security::TenantId;

use crate::migrate::{MigrateError, TENANT_COLUMN};
use crate::sql::is_valid_ident;

/// One evolution step. Steps are applied in ascending `sequence_id` order and each is
/// recorded in `schema_migrations` once it commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationStep {
    pub sequence_id: i64,
    pub description: String,
    pub action: StepAction,
}

impl MigrationStep {
    pub fn new(sequence_id: i64, description: impl Into<String>, action: StepAction) -> Self {
        Self {
            sequence_id,
            description: description.into(),
            action,
        }
    }

    /// Structural checks that need no database.
    ///
    /// # Errors
    /// `InvalidPlan` for bad identifiers, duplicate tables, or a fallback without a
    /// justification.
    pub fn validate(&self) -> Result<(), MigrateError> {
        match &self.action {
            StepAction::TenantRegistry | StepAction::AuditLog => Ok(()),
            StepAction::Sql { forward, .. } => {
                if forward.iter().all(|s| s.trim().is_empty()) {
                    return Err(MigrateError::InvalidPlan(format!(
                        "step {} has no forward statements",
                        self.sequence_id
                    )));
                }
                Ok(())
            }
            StepAction::IsolateTables { tables } => {
                if tables.is_empty() {
                    return Err(MigrateError::InvalidPlan(format!(
                        "step {} isolates no tables",
                        self.sequence_id
                    )));
                }
                let mut seen = HashSet::new();
                for plan in tables {
                    plan.validate()?;
                    if !seen.insert(plan.table.as_str()) {
                        return Err(MigrateError::InvalidPlan(format!(
                            "table '{}' appears twice in step {}",
                            plan.table, self.sequence_id
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum StepAction {
    /// `tenants` table, the PostgreSQL tenant functions and the registry policy.
    TenantRegistry,
    /// `audit_logs` table with its index and policy.
    AuditLog,
    /// Retrofit `tenant_id` onto existing tables.
    IsolateTables { tables: Vec<TenantColumnPlan> },
    /// Raw statements for changes the typed actions do not cover.
    Sql {
        forward: Vec<String>,
        #[serde(default)]
        reverse: Vec<String>,
    },
}

/// How one table gets its `tenant_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantColumnPlan {
    pub table: String,
    #[serde(default = "default_key")]
    pub key_column: String,
    pub source: TenantSource,
    #[serde(default)]
    pub orphans: OrphanPolicy,
}

impl TenantColumnPlan {
    pub fn new(table: impl Into<String>, source: TenantSource) -> Self {
        Self {
            table: table.into(),
            key_column: default_key(),
            source,
            orphans: OrphanPolicy::Fail,
        }
    }

    #[must_use]
    pub fn with_orphans(mut self, orphans: OrphanPolicy) -> Self {
        self.orphans = orphans;
        self
    }

    /// The in-step parent this table derives from, if any.
    pub(crate) fn parent_table(&self) -> Option<&str> {
        match &self.source {
            TenantSource::Parent { parent_table, .. } => Some(parent_table),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), MigrateError> {
        let mut idents = vec![self.table.as_str(), self.key_column.as_str()];
        match &self.source {
            TenantSource::Parent {
                foreign_key,
                parent_table,
                parent_key,
                parent_tenant_column,
            } => {
                if parent_table == &self.table {
                    return Err(MigrateError::InvalidPlan(format!(
                        "table '{}' cannot derive its tenant from itself",
                        self.table
                    )));
                }
                idents.extend([
                    foreign_key.as_str(),
                    parent_table.as_str(),
                    parent_key.as_str(),
                    parent_tenant_column.as_str(),
                ]);
            }
            TenantSource::Column { column } => {
                if column == TENANT_COLUMN {
                    return Err(MigrateError::InvalidPlan(format!(
                        "table '{}': use the existing source for a column already named {TENANT_COLUMN}",
                        self.table
                    )));
                }
                idents.push(column);
            }
            TenantSource::Existing => {}
        }
        if let Some(bad) = idents.into_iter().find(|i| !is_valid_ident(i)) {
            return Err(MigrateError::InvalidPlan(format!(
                "'{bad}' is not a valid identifier"
            )));
        }
        if let OrphanPolicy::AssignFallback { justification, .. } = &self.orphans {
            if justification.trim().is_empty() {
                return Err(MigrateError::InvalidPlan(format!(
                    "fallback tenant for '{}' needs a justification",
                    self.table
                )));
            }
        }
        Ok(())
    }
}

fn default_key() -> String {
    "id".to_owned()
}

fn default_tenant_column() -> String {
    TENANT_COLUMN.to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum TenantSource {
    /// `child.tenant_id = parent.<parent_tenant_column>` joined through `foreign_key`.
    Parent {
        foreign_key: String,
        parent_table: String,
        #[serde(default = "default_key")]
        parent_key: String,
        #[serde(default = "default_tenant_column")]
        parent_tenant_column: String,
    },
    /// Copy from a legacy tenant-bearing column on the same table.
    Column { column: String },
    /// `tenant_id` is already there; verify and promote only.
    Existing,
}

/// What to do with rows whose tenant cannot be derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum OrphanPolicy {
    /// Abort the step with the offending row ids.
    #[default]
    Fail,
    /// Assign every orphan to one documented tenant.
    AssignFallback {
        tenant: TenantId,
        justification: String,
    },
}
