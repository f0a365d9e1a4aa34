#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(feature = "sqlite")]

mod common;

use common::{actor, client, new_client, setup, Fixture};
use sea_orm::ActiveValue::Set;
use tenancy_db::audit::{
    AuditAction, AuditConfig, AuditFilter, AuditLogger, AuditMode, AuditPage, DateRange,
    ExportFormat, Page, REDACTED, entity as audit_entity,
};
use tenancy_db::context::TenantContextManager;
use tenancy_db::migrate::{MigrationStep, Orchestrator, StepAction};
use tenancy_db::TenancyError;
use tenancy_security::TenantId;
use tracing_test::traced_test;

fn clients_only() -> AuditFilter {
    AuditFilter {
        entity_type: Some("clients".to_owned()),
        ..Default::default()
    }
}

async fn entries(fx: &Fixture, tenant: TenantId, filter: AuditFilter) -> AuditPage {
    fx.manager
        .with_tenant(&fx.ctx(tenant), |uow| {
            Box::pin(async move {
                uow.list_audit_entries(tenant, &filter, Page::default()).await
            })
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn mutations_leave_snapshots_in_the_tenant_log() {
    let fx = setup(AuditConfig::default()).await;
    let ctx = fx.ctx(fx.tenant_a);
    let id = fx
        .manager
        .with_tenant(&ctx, |uow| {
            Box::pin(async move { uow.insert::<client::Entity>(new_client("before")).await })
        })
        .await
        .unwrap()
        .id;
    fx.manager
        .with_tenant(&ctx, |uow| {
            Box::pin(async move {
                uow.update::<client::Entity>(client::ActiveModel {
                    id: Set(id),
                    name: Set("after".to_owned()),
                    ..Default::default()
                })
                .await
            })
        })
        .await
        .unwrap();
    fx.manager
        .with_tenant(&ctx, |uow| {
            Box::pin(async move { uow.delete::<client::Entity>(id).await })
        })
        .await
        .unwrap();

    let page = entries(&fx, fx.tenant_a, clients_only()).await;
    assert_eq!(page.total, 3);
    let mut log = page.entries;
    log.reverse();
    let actions: Vec<_> = log.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        [AuditAction::Create, AuditAction::Update, AuditAction::Delete]
    );
    assert!(log.iter().all(|e| e.entity_id == id.to_string()));
    assert!(log.iter().all(|e| e.actor_id == actor().as_uuid()));
    assert!(log.iter().all(|e| e.tenant_id == fx.tenant_a.as_uuid()));

    let created = &log[0];
    assert!(created.before_state.is_none());
    let after = created.after_state.as_ref().unwrap();
    assert_eq!(after["name"], "before");
    assert_eq!(after["api_token"], REDACTED);

    let updated = &log[1];
    assert_eq!(
        updated.before_state.as_ref().unwrap(),
        &serde_json::json!({ "name": "before" })
    );
    assert_eq!(
        updated.after_state.as_ref().unwrap(),
        &serde_json::json!({ "name": "after" })
    );

    let deleted = &log[2];
    assert_eq!(deleted.before_state.as_ref().unwrap()["name"], "after");
    assert!(deleted.after_state.is_none());

    let other = entries(&fx, fx.tenant_b, clients_only()).await;
    assert_eq!(other.total, 0);
}

#[tokio::test]
async fn provisioning_is_audited_under_the_new_tenant() {
    let fx = setup(AuditConfig::default()).await;
    let page = entries(
        &fx,
        fx.tenant_b,
        AuditFilter {
            entity_type: Some("tenants".to_owned()),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(page.total, 1);
    assert_eq!(page.entries[0].action, AuditAction::Create);
    assert_eq!(page.entries[0].entity_id, fx.tenant_b.to_string());
}

#[tokio::test]
async fn only_sensitive_entities_audit_reads() {
    let fx = setup(AuditConfig {
        sensitive_entities: vec!["clients".to_owned()],
        ..Default::default()
    })
    .await;
    let ctx = fx.ctx(fx.tenant_a);
    fx.manager
        .with_tenant(&ctx, |uow| {
            Box::pin(async move {
                uow.insert::<client::Entity>(new_client("one")).await?;
                uow.insert::<client::Entity>(new_client("two")).await?;
                Ok::<_, TenancyError>(())
            })
        })
        .await
        .unwrap();
    fx.manager
        .with_tenant(&ctx, |uow| {
            Box::pin(async move {
                uow.select::<client::Entity>().all().await?;
                uow.select::<tenancy_db::tenants::Entity>().all().await
            })
        })
        .await
        .unwrap();

    let reads = entries(
        &fx,
        fx.tenant_a,
        AuditFilter {
            action: Some(AuditAction::Read),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(reads.total, 2);
    assert!(reads.entries.iter().all(|e| e.entity_type == "clients"));
    assert!(
        reads
            .entries
            .iter()
            .all(|e| e.after_state.as_ref().unwrap()["api_token"] == REDACTED)
    );
}

#[tokio::test]
async fn audit_entries_cannot_be_written_by_business_code() {
    let fx = setup(AuditConfig::default()).await;
    let tenant = fx.tenant_a;
    let existing = entries(&fx, tenant, AuditFilter::default()).await;
    assert_eq!(existing.total, 1);
    let entry_id = existing.entries[0].id;

    let outcomes = fx
        .manager
        .with_tenant(&fx.ctx(tenant), |uow| {
            Box::pin(async move {
                let forged = uow
                    .insert::<audit_entity::Entity>(audit_entity::ActiveModel {
                        id: Set(uuid::Uuid::new_v4()),
                        tenant_id: Set(tenant.as_uuid()),
                        actor_id: Set(actor().as_uuid()),
                        entity_type: Set("clients".to_owned()),
                        entity_id: Set("forged".to_owned()),
                        action: Set(AuditAction::Create),
                        before_state: Set(None),
                        after_state: Set(None),
                        occurred_at: Set(chrono::Utc::now()),
                    })
                    .await;
                let rewritten = uow
                    .update::<audit_entity::Entity>(audit_entity::ActiveModel {
                        id: Set(entry_id),
                        entity_id: Set("rewritten".to_owned()),
                        ..Default::default()
                    })
                    .await;
                let deleted = uow.delete::<audit_entity::Entity>(entry_id).await;
                Ok::<_, TenancyError>([forged.err(), rewritten.err(), deleted.err()])
            })
        })
        .await
        .unwrap();
    for outcome in outcomes {
        assert!(matches!(outcome, Some(TenancyError::AppendOnly { .. })), "{outcome:?}");
    }

    let after = entries(&fx, tenant, AuditFilter::default()).await;
    assert_eq!(after.total, 1);
    assert_eq!(after.entries[0].id, entry_id);
}

#[tokio::test]
async fn another_tenants_log_is_out_of_reach() {
    let fx = setup(AuditConfig::default()).await;
    let other = fx.tenant_b;
    let err = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
            Box::pin(async move {
                uow.list_audit_entries(other, &AuditFilter::default(), Page::default())
                    .await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::CrossTenantRead { .. }));

    let err = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
            Box::pin(async move {
                uow.export_audit_report(other, DateRange::all(), ExportFormat::Json)
                    .await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::CrossTenantRead { .. }));
}

#[tokio::test]
async fn rolled_back_work_leaves_no_entries() {
    for mode in [AuditMode::Inline, AuditMode::Queued] {
        let fx = setup(AuditConfig {
            mode,
            ..Default::default()
        })
        .await;
        let res: Result<(), TenancyError> = fx
            .manager
            .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
                Box::pin(async move {
                    uow.insert::<client::Entity>(new_client("discarded")).await?;
                    Err(TenancyError::InvalidEntity("aborted"))
                })
            })
            .await;
        assert!(res.is_err());
        fx.manager.audit().flush().await;
        assert_eq!(entries(&fx, fx.tenant_a, clients_only()).await.total, 0, "{mode:?}");
    }
}

#[tokio::test]
async fn queued_entries_are_written_after_commit() {
    let fx = setup(AuditConfig {
        mode: AuditMode::Queued,
        ..Default::default()
    })
    .await;
    fx.manager.audit().flush().await;
    let provisioned = fx.manager.audit().metrics().written();
    assert_eq!(provisioned, 2);

    for name in ["q1", "q2", "q3"] {
        fx.manager
            .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
                Box::pin(async move { uow.insert::<client::Entity>(new_client(name)).await })
            })
            .await
            .unwrap();
    }
    fx.manager.audit().flush().await;

    assert_eq!(fx.manager.audit().metrics().written(), provisioned + 3);
    assert_eq!(fx.manager.audit().metrics().failures(), 0);
    let page = entries(&fx, fx.tenant_a, clients_only()).await;
    let names: Vec<_> = page
        .entries
        .iter()
        .rev()
        .map(|e| e.after_state.as_ref().unwrap()["name"].clone())
        .collect();
    assert_eq!(names, ["q1", "q2", "q3"]);
}

#[tokio::test]
async fn reports_export_as_json_and_csv() {
    let fx = setup(AuditConfig::default()).await;
    let tenant = fx.tenant_a;
    let from = chrono::Utc::now() - chrono::Duration::minutes(1);
    fx.manager
        .with_tenant(&fx.ctx(tenant), |uow| {
            Box::pin(async move {
                uow.insert::<client::Entity>(new_client("x, \"quoted\"")).await?;
                uow.insert::<client::Entity>(new_client("y")).await?;
                Ok::<_, TenancyError>(())
            })
        })
        .await
        .unwrap();
    let to = chrono::Utc::now() + chrono::Duration::minutes(1);

    let (json, csv, empty) = fx
        .manager
        .with_tenant(&fx.ctx(tenant), |uow| {
            Box::pin(async move {
                let range = DateRange::between(from, to);
                let json = uow.export_audit_report(tenant, range, ExportFormat::Json).await?;
                let csv = uow.export_audit_report(tenant, range, ExportFormat::Csv).await?;
                let empty = uow
                    .export_audit_report(tenant, DateRange::between(to, to), ExportFormat::Json)
                    .await?;
                Ok::<_, TenancyError>((json, csv, empty))
            })
        })
        .await
        .unwrap();

    let json: Vec<serde_json::Value> = serde_json::from_slice(&json).unwrap();
    // Tenant record plus two clients.
    assert_eq!(json.len(), 3);
    assert_eq!(json[0]["entity_type"], "tenants");

    let csv = String::from_utf8(csv).unwrap();
    assert!(csv.starts_with("id,occurred_at,actor_id,entity_type"));
    assert!(csv.contains("clients"));
    // JSON escapes the quote, then CSV doubles it.
    assert!(csv.contains(r#"x, \""quoted\"""#));

    let empty: Vec<serde_json::Value> = serde_json::from_slice(&empty).unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
#[traced_test]
async fn failed_audit_write_does_not_fail_the_mutation() {
    // Audit log installed last so it can be reverted on its own.
    let mut steps: Vec<MigrationStep> = common::client_steps()
        .into_iter()
        .filter(|s| !matches!(s.action, StepAction::AuditLog))
        .collect();
    steps.push(MigrationStep::new(5, "audit log", StepAction::AuditLog));

    let db = common::memory_db().await;
    let orchestrator = Orchestrator::new(&db);
    orchestrator.apply(&steps, None).await.unwrap();
    orchestrator.revert(&steps, 1).await.unwrap();

    let manager = TenantContextManager::new(
        db.store(),
        AuditLogger::new(AuditConfig::default(), db.store()),
    );
    let tenant = manager.provision_tenant("Initech", actor()).await.unwrap();
    let tenant = TenantId::try_from(tenant.id).unwrap();
    let created = manager
        .with_tenant(&common::Fixture::ctx_for(tenant), |uow| {
            Box::pin(async move { uow.insert::<client::Entity>(new_client("kept")).await })
        })
        .await
        .unwrap();

    let found = manager
        .with_tenant(&common::Fixture::ctx_for(tenant), |uow| {
            Box::pin(async move { uow.find_by_id::<client::Entity>(created.id).await })
        })
        .await
        .unwrap();
    assert!(found.is_some());
    assert_eq!(manager.audit().metrics().failures(), 2);
    assert_eq!(manager.audit().metrics().written(), 0);
    assert!(logs_contain("audit write failed"));
}
