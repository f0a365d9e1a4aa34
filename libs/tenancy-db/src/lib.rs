#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Tenant-isolated storage on top of `SeaORM`.
//!
//! The crate is layered bottom-up:
//! - [`secure`]: the isolation predicate store. Every statement against an isolated
//!   table carries `tenant_id = <bound tenant>`; with nothing bound it matches nothing.
//! - [`context`]: binds exactly one tenant to one pooled session for one unit of work.
//! - [`migrate`]: the schema evolution orchestrator that retrofits isolation onto
//!   live tables (add column, backfill, verify, promote, policy, index).
//! - [`audit`]: the tenant-attributed mutation trail, attached to every write.
//!
//! # Example
//! ```rust,no_run
//! use tenancy_db::{ConnectOpts, TenancyDb};
//! use tenancy_db::audit::{AuditConfig, AuditLogger};
//! use tenancy_db::context::TenantContextManager;
//! use tenancy_security::{ActorId, SecurityContext, TenantId};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let db = TenancyDb::connect("sqlite://tenancy.db?mode=rwc", ConnectOpts::default()).await?;
//! let audit = AuditLogger::new(AuditConfig::default(), db.store());
//! let manager = TenantContextManager::new(db.store(), audit);
//!
//! let ctx = SecurityContext::for_tenant(TenantId::random(), ActorId::system());
//! let tenant = manager
//!     .with_tenant(&ctx, |uow| Box::pin(async move { Ok::<_, tenancy_db::TenancyError>(uow.tenant_id()) }))
//!     .await?;
//! # let _ = tenant;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(
    not(any(feature = "pg", feature = "sqlite")),
    allow(unused_imports, unused_variables, dead_code, unreachable_code)
)]

pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod migrate;
pub mod secure;
pub mod tenants;

mod pool_opts;
mod sql;

pub use error::{PublicOutcome, TenancyError};

use std::time::Duration;

#[cfg(any(feature = "pg", feature = "sqlite"))]
use pool_opts::ApplyPoolOpts;

#[cfg(feature = "pg")]
use sea_orm::SqlxPostgresConnector;
#[cfg(feature = "sqlite")]
use sea_orm::SqlxSqliteConnector;
#[cfg(feature = "pg")]
use sea_orm::sqlx::postgres::PgPoolOptions;
#[cfg(feature = "sqlite")]
use sea_orm::sqlx::sqlite::SqlitePoolOptions;

use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection};
use thiserror::Error;

use crate::secure::IsolationStore;

/// Library-local result type for connection setup.
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors raised while opening the pool.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Unknown DSN: {0}")]
    UnknownDsn(String),

    #[error("Feature not enabled: {0}")]
    FeatureDisabled(&'static str),

    #[cfg(any(feature = "pg", feature = "sqlite"))]
    #[error(transparent)]
    Sqlx(#[from] sea_orm::sqlx::Error),

    #[error(transparent)]
    Sea(#[from] sea_orm::DbErr),
}

/// Supported engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbEngine {
    Postgres,
    Sqlite,
}

/// Connection pool options; each driver applies the subset it supports.
#[derive(Clone, Debug)]
pub struct ConnectOpts {
    /// Maximum number of connections in the pool.
    pub max_conns: Option<u32>,
    /// Minimum number of connections in the pool.
    pub min_conns: Option<u32>,
    /// Timeout to acquire a connection from the pool.
    pub acquire_timeout: Option<Duration>,
    /// Idle timeout before a connection is closed.
    pub idle_timeout: Option<Duration>,
    /// Test connection health before acquire.
    pub test_before_acquire: bool,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            max_conns: Some(10),
            min_conns: None,
            acquire_timeout: Some(Duration::from_secs(30)),
            idle_timeout: None,
            test_before_acquire: false,
        }
    }
}

#[cfg(feature = "sqlite")]
const DEFAULT_SQLITE_BUSY_TIMEOUT: i64 = 5000;

/// Handle to the shared pool. Cloning is cheap.
#[derive(Clone)]
pub struct TenancyDb {
    engine: DbEngine,
    dsn: String,
    sea: DatabaseConnection,
}

impl std::fmt::Debug for TenancyDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenancyDb")
            .field("engine", &self.engine)
            .field("dsn", &redact_credentials_in_dsn(Some(&self.dsn)))
            .finish_non_exhaustive()
    }
}

impl TenancyDb {
    /// Detect engine by DSN scheme.
    ///
    /// # Errors
    /// Returns `DbError::UnknownDsn` if the DSN scheme is not recognized.
    pub fn detect(dsn: &str) -> Result<DbEngine> {
        let s = dsn.trim_start();
        if s.starts_with("postgres://") || s.starts_with("postgresql://") {
            Ok(DbEngine::Postgres)
        } else if s.starts_with("sqlite:") {
            Ok(DbEngine::Sqlite)
        } else {
            Err(DbError::UnknownDsn(redact_credentials_in_dsn(Some(dsn))))
        }
    }

    /// Open the pool.
    ///
    /// # Errors
    /// Returns an error if the DSN is invalid, the backend feature is off, or the
    /// connection fails.
    pub async fn connect(dsn: &str, opts: ConnectOpts) -> Result<Self> {
        let engine = Self::detect(dsn)?;
        let sea = match engine {
            #[cfg(feature = "pg")]
            DbEngine::Postgres => {
                let pool = PgPoolOptions::new().apply(&opts).connect(dsn).await?;
                SqlxPostgresConnector::from_sqlx_postgres_pool(pool)
            }
            #[cfg(not(feature = "pg"))]
            DbEngine::Postgres => {
                return Err(DbError::FeatureDisabled("PostgreSQL feature not enabled"));
            }
            #[cfg(feature = "sqlite")]
            DbEngine::Sqlite => {
                let is_memory = dsn.contains(":memory:") || dsn.contains("mode=memory");
                let pool = SqlitePoolOptions::new()
                    .apply(&opts)
                    .after_connect(move |conn, _meta| {
                        Box::pin(async move {
                            sea_orm::sqlx::query("PRAGMA foreign_keys = ON")
                                .execute(&mut *conn)
                                .await?;
                            if !is_memory {
                                // PRAGMA takes no bound parameters.
                                let pragma =
                                    format!("PRAGMA busy_timeout = {DEFAULT_SQLITE_BUSY_TIMEOUT}");
                                sea_orm::sqlx::query(&pragma).execute(&mut *conn).await?;
                            }
                            Ok(())
                        })
                    })
                    .connect(dsn)
                    .await?;
                SqlxSqliteConnector::from_sqlx_sqlite_pool(pool)
            }
            #[cfg(not(feature = "sqlite"))]
            DbEngine::Sqlite => {
                return Err(DbError::FeatureDisabled("SQLite feature not enabled"));
            }
        };

        tracing::debug!(
            engine = ?engine,
            dsn = %redact_credentials_in_dsn(Some(dsn)),
            "database pool opened"
        );

        Ok(Self {
            engine,
            dsn: dsn.to_owned(),
            sea,
        })
    }

    #[must_use]
    pub fn engine(&self) -> DbEngine {
        self.engine
    }

    #[must_use]
    pub fn backend(&self) -> DatabaseBackend {
        self.sea.get_database_backend()
    }

    /// Isolation store over this pool: the only way runtime code reaches tables.
    #[must_use]
    pub fn store(&self) -> IsolationStore {
        IsolationStore::new(self.sea.clone())
    }

    /// Privileged connection for schema evolution. Not exposed outside the crate.
    pub(crate) fn privileged(&self) -> &DatabaseConnection {
        &self.sea
    }
}

/// Replace the password component of a DSN with `***`.
#[must_use]
pub fn redact_credentials_in_dsn(dsn: Option<&str>) -> String {
    match dsn {
        Some(dsn) if dsn.contains('@') => {
            if let Ok(mut parsed) = url::Url::parse(dsn) {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                parsed.to_string()
            } else {
                "***".to_owned()
            }
        }
        Some(dsn) => dsn.to_owned(),
        None => "none".to_owned(),
    }
}
