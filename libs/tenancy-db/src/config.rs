//! Typed configuration.
//!
//! Plain serde structs; layering (defaults, YAML, environment) is the job of the
//! binary that loads them. Unknown fields are rejected everywhere.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConnectOpts;
use crate::audit::AuditConfig;
use crate::migrate::MigrationStep;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TenancyConfig {
    pub database: DatabaseConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
    /// Ordered evolution steps consumed by the orchestrator.
    pub steps: Vec<MigrationStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    /// `postgres://...` or `sqlite:...`.
    pub dsn: String,
    pub max_conns: Option<u32>,
    pub min_conns: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let opts = ConnectOpts::default();
        Self {
            dsn: "sqlite://tenancy.db?mode=rwc".to_owned(),
            max_conns: opts.max_conns,
            min_conns: opts.min_conns,
            acquire_timeout: opts.acquire_timeout,
        }
    }
}

impl DatabaseConfig {
    #[must_use]
    pub fn connect_opts(&self) -> ConnectOpts {
        ConnectOpts {
            max_conns: self.max_conns,
            min_conns: self.min_conns,
            acquire_timeout: self.acquire_timeout,
            ..ConnectOpts::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::audit::AuditMode;
    use crate::migrate::{OrphanPolicy, StepAction, TenantSource};

    #[test]
    fn parses_full_document() {
        let cfg: TenancyConfig = serde_json::from_value(serde_json::json!({
            "database": { "dsn": "postgres://app@db/app", "max_conns": 4, "acquire_timeout": "5s" },
            "audit": { "mode": "queued", "sensitive_entities": ["clients"] },
            "logging": { "level": "debug", "json": true },
            "steps": [
                { "sequence_id": 1, "description": "registry", "action": { "kind": "tenant_registry" } },
                {
                    "sequence_id": 2,
                    "description": "isolate orders",
                    "action": {
                        "kind": "isolate_tables",
                        "tables": [
                            { "table": "customers", "source": { "column": { "column": "org_id" } } },
                            {
                                "table": "orders",
                                "source": { "parent": { "foreign_key": "customer_id", "parent_table": "customers" } }
                            }
                        ]
                    }
                }
            ]
        }))
        .unwrap();

        assert_eq!(cfg.database.max_conns, Some(4));
        assert_eq!(cfg.database.acquire_timeout, Some(Duration::from_secs(5)));
        assert_eq!(cfg.audit.mode, AuditMode::Queued);
        assert!(cfg.logging.json);
        assert_eq!(cfg.steps.len(), 2);
        let StepAction::IsolateTables { tables } = &cfg.steps[1].action else {
            panic!("expected isolate_tables");
        };
        assert_eq!(tables[1].key_column, "id");
        assert!(matches!(tables[1].orphans, OrphanPolicy::Fail));
        let TenantSource::Parent { parent_key, parent_tenant_column, .. } = &tables[1].source else {
            panic!("expected parent source");
        };
        assert_eq!(parent_key, "id");
        assert_eq!(parent_tenant_column, "tenant_id");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let res: Result<TenancyConfig, _> =
            serde_json::from_value(serde_json::json!({ "database": { "url": "x" } }));
        assert!(res.is_err());
    }

    #[test]
    fn connect_opts_follow_config() {
        let db = DatabaseConfig {
            max_conns: Some(2),
            ..DatabaseConfig::default()
        };
        let opts = db.connect_opts();
        assert_eq!(opts.max_conns, Some(2));
        assert!(!opts.test_before_acquire);
    }
}
