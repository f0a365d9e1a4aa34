#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

use tenancy_db::audit::{AuditConfig, AuditLogger};
use tenancy_db::context::TenantContextManager;
use tenancy_db::migrate::{
    MigrationStep, Orchestrator, StepAction, TenantColumnPlan, TenantSource,
};
use tenancy_db::{ConnectOpts, TenancyDb};
use tenancy_security::{ActorId, SecurityContext, TenantId};
use uuid::Uuid;

pub mod client {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "clients")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub tenant_id: Uuid,
        pub name: String,
        pub api_token: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}

    impl tenancy_db::secure::IsolatedEntity for Entity {
        fn tenant_col() -> Self::Column {
            Column::TenantId
        }
        fn id_col() -> Self::Column {
            Column::Id
        }
    }
}

pub mod order {
    use sea_orm::entity::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "orders")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub customer_id: Option<i64>,
        pub total: i64,
        pub tenant_id: Uuid,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}

    impl tenancy_db::secure::IsolatedEntity for Entity {
        fn tenant_col() -> Self::Column {
            Column::TenantId
        }
        fn id_col() -> Self::Column {
            Column::Id
        }
    }
}

/// `sqlite::memory:` behind a single pooled connection, so every unit of work reuses
/// the same session.
pub async fn memory_db() -> TenancyDb {
    let opts = ConnectOpts {
        max_conns: Some(1),
        ..Default::default()
    };
    TenancyDb::connect("sqlite::memory:", opts)
        .await
        .expect("Failed to connect to database")
}

pub async fn file_db(dir: &tempfile::TempDir, max_conns: u32) -> (TenancyDb, String) {
    let path = dir.path().join("tenancy.db");
    let dsn = format!("sqlite://{}?mode=rwc", path.display());
    let opts = ConnectOpts {
        max_conns: Some(max_conns),
        ..Default::default()
    };
    let db = TenancyDb::connect(&dsn, opts)
        .await
        .expect("Failed to connect to database");
    (db, dsn)
}

/// SQLite literal for a UUID stored as a blob.
pub fn blob(id: Uuid) -> String {
    format!("X'{}'", id.simple())
}

pub fn registry_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep::new(1, "tenant registry", StepAction::TenantRegistry),
        MigrationStep::new(2, "audit log", StepAction::AuditLog),
    ]
}

/// Registry, audit log, and a `clients` table created with its tenant column in place.
pub fn client_steps() -> Vec<MigrationStep> {
    let mut steps = registry_steps();
    steps.push(MigrationStep::new(
        3,
        "clients table",
        StepAction::Sql {
            forward: vec![
                "CREATE TABLE clients (
                    id BLOB PRIMARY KEY NOT NULL,
                    tenant_id BLOB NOT NULL REFERENCES tenants (id),
                    name TEXT NOT NULL,
                    api_token TEXT
                )"
                .to_owned(),
            ],
            reverse: vec!["DROP TABLE clients".to_owned()],
        },
    ));
    steps.push(MigrationStep::new(
        4,
        "isolate clients",
        StepAction::IsolateTables {
            tables: vec![TenantColumnPlan::new("clients", TenantSource::Existing)],
        },
    ));
    steps
}

pub struct Fixture {
    pub db: TenancyDb,
    pub manager: TenantContextManager,
    pub tenant_a: TenantId,
    pub tenant_b: TenantId,
}

impl Fixture {
    pub fn ctx(&self, tenant: TenantId) -> SecurityContext {
        Self::ctx_for(tenant)
    }

    pub fn ctx_for(tenant: TenantId) -> SecurityContext {
        SecurityContext::for_tenant(tenant, actor())
    }
}

pub fn actor() -> ActorId {
    ActorId::new(Uuid::from_u128(0xa11c_e000_0000_4000_8000_0000_0000_0001))
}

/// Memory database with the client schema applied and two tenants provisioned.
pub async fn setup(config: AuditConfig) -> Fixture {
    let db = memory_db().await;
    Orchestrator::new(&db)
        .apply(&client_steps(), None)
        .await
        .expect("schema setup failed");
    let audit = AuditLogger::new(config, db.store());
    let manager = TenantContextManager::new(db.store(), audit);
    let a = manager.provision_tenant("Acme", actor()).await.unwrap();
    let b = manager.provision_tenant("Globex", actor()).await.unwrap();
    Fixture {
        db,
        manager,
        tenant_a: TenantId::try_from(a.id).unwrap(),
        tenant_b: TenantId::try_from(b.id).unwrap(),
    }
}

pub fn new_client(name: &str) -> client::ActiveModel {
    use sea_orm::ActiveValue::{NotSet, Set};
    client::ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: NotSet,
        name: Set(name.to_owned()),
        api_token: Set(Some(format!("tok-{name}"))),
    }
}
