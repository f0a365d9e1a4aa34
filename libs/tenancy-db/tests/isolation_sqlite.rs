#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(feature = "sqlite")]

mod common;

use common::{client, new_client, setup};
use sea_orm::ActiveValue::Set;
use tenancy_db::audit::AuditConfig;
use tenancy_db::{PublicOutcome, TenancyError};

#[tokio::test]
async fn tenants_only_see_their_own_rows() {
    let fx = setup(AuditConfig::default()).await;

    fx.manager
        .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
            Box::pin(async move {
                uow.insert::<client::Entity>(new_client("a1")).await?;
                uow.insert::<client::Entity>(new_client("a2")).await?;
                Ok::<_, TenancyError>(())
            })
        })
        .await
        .unwrap();
    fx.manager
        .with_tenant(&fx.ctx(fx.tenant_b), |uow| {
            Box::pin(async move {
                uow.insert::<client::Entity>(new_client("b1")).await?;
                Ok::<_, TenancyError>(())
            })
        })
        .await
        .unwrap();

    let seen_by_a = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
            Box::pin(async move { uow.select::<client::Entity>().all().await })
        })
        .await
        .unwrap();
    let seen_by_b = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_b), |uow| {
            Box::pin(async move { uow.select::<client::Entity>().all().await })
        })
        .await
        .unwrap();

    assert_eq!(seen_by_a.len(), 2);
    assert!(seen_by_a.iter().all(|c| c.tenant_id == fx.tenant_a.as_uuid()));
    assert_eq!(seen_by_b.len(), 1);
    assert_eq!(seen_by_b[0].name, "b1");
}

#[tokio::test]
async fn insert_is_stamped_with_the_bound_tenant() {
    let fx = setup(AuditConfig::default()).await;
    let created = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
            Box::pin(async move { uow.insert::<client::Entity>(new_client("stamped")).await })
        })
        .await
        .unwrap();
    assert_eq!(created.tenant_id, fx.tenant_a.as_uuid());
}

#[tokio::test]
async fn insert_naming_another_tenant_is_forbidden() {
    let fx = setup(AuditConfig::default()).await;
    let other = fx.tenant_b.as_uuid();
    let err = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
            Box::pin(async move {
                let mut am = new_client("smuggled");
                am.tenant_id = Set(other);
                uow.insert::<client::Entity>(am).await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::CrossTenantWrite { .. }));
    assert_eq!(err.public_outcome(), PublicOutcome::Forbidden);
}

#[tokio::test]
async fn foreign_rows_are_indistinguishable_from_missing_ones() {
    let fx = setup(AuditConfig::default()).await;
    let owned = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
            Box::pin(async move { uow.insert::<client::Entity>(new_client("owned")).await })
        })
        .await
        .unwrap();
    let id = owned.id;

    let update_err = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_b), |uow| {
            Box::pin(async move {
                uow.update::<client::Entity>(client::ActiveModel {
                    id: Set(id),
                    name: Set("hijacked".to_owned()),
                    ..Default::default()
                })
                .await
            })
        })
        .await
        .unwrap_err();
    let delete_err = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_b), |uow| {
            Box::pin(async move { uow.delete::<client::Entity>(id).await })
        })
        .await
        .unwrap_err();
    let missing_err = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_b), |uow| {
            Box::pin(async move { uow.delete::<client::Entity>(uuid::Uuid::new_v4()).await })
        })
        .await
        .unwrap_err();

    for err in [&update_err, &delete_err, &missing_err] {
        assert!(matches!(err, TenancyError::NotFound { .. }), "{err:?}");
        assert_eq!(err.public_outcome(), PublicOutcome::NotFound);
    }
    assert_eq!(delete_err.to_string(), missing_err.to_string());

    let found_by_b = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_b), |uow| {
            Box::pin(async move { uow.find_by_id::<client::Entity>(id).await })
        })
        .await
        .unwrap();
    assert!(found_by_b.is_none());

    let still_there = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
            Box::pin(async move { uow.find_by_id::<client::Entity>(id).await })
        })
        .await
        .unwrap()
        .expect("row must survive");
    assert_eq!(still_there.name, "owned");
}

#[tokio::test]
async fn owner_can_update_and_delete() {
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

    let updated = fx
        .manager
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
    assert_eq!(updated.name, "after");
    assert_eq!(updated.api_token.as_deref(), Some("tok-before"));

    fx.manager
        .with_tenant(&ctx, |uow| {
            Box::pin(async move { uow.delete::<client::Entity>(id).await })
        })
        .await
        .unwrap();
    let gone = fx
        .manager
        .with_tenant(&ctx, |uow| {
            Box::pin(async move { uow.find_by_id::<client::Entity>(id).await })
        })
        .await
        .unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn update_cannot_move_a_row_to_another_tenant() {
    let fx = setup(AuditConfig::default()).await;
    let ctx = fx.ctx(fx.tenant_a);
    let target = fx.tenant_b.as_uuid();
    let id = fx
        .manager
        .with_tenant(&ctx, |uow| {
            Box::pin(async move { uow.insert::<client::Entity>(new_client("mine")).await })
        })
        .await
        .unwrap()
        .id;

    let err = fx
        .manager
        .with_tenant(&ctx, |uow| {
            Box::pin(async move {
                uow.update::<client::Entity>(client::ActiveModel {
                    id: Set(id),
                    tenant_id: Set(target),
                    name: Set("moved".to_owned()),
                    ..Default::default()
                })
                .await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::CrossTenantWrite { .. }));
    assert_eq!(err.public_outcome(), PublicOutcome::Forbidden);

    let still_mine = fx
        .manager
        .with_tenant(&ctx, |uow| {
            Box::pin(async move { uow.find_by_id::<client::Entity>(id).await })
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still_mine.tenant_id, fx.tenant_a.as_uuid());
    assert_eq!(still_mine.name, "mine");

    let seen_by_b = fx
        .manager
        .with_tenant(&fx.ctx(fx.tenant_b), |uow| {
            Box::pin(async move { uow.find_by_id::<client::Entity>(id).await })
        })
        .await
        .unwrap();
    assert!(seen_by_b.is_none());
}

#[tokio::test]
async fn unbound_session_reads_nothing_and_cannot_write() {
    let fx = setup(AuditConfig::default()).await;
    fx.manager
        .with_tenant(&fx.ctx(fx.tenant_a), |uow| {
            Box::pin(async move { uow.insert::<client::Entity>(new_client("hidden")).await })
        })
        .await
        .unwrap();

    let session = fx.db.store().acquire().await.unwrap();
    assert!(session.current_tenant().is_none());
    assert!(session.select::<client::Entity>().all().await.unwrap().is_empty());
    assert_eq!(session.select::<client::Entity>().count().await.unwrap(), 0);
    assert!(matches!(
        session.insert::<client::Entity>(new_client("nobody")).await,
        Err(TenancyError::MissingTenant)
    ));
    assert!(matches!(
        session.delete::<client::Entity>(uuid::Uuid::new_v4()).await,
        Err(TenancyError::MissingTenant)
    ));
    session.rollback().await.unwrap();
}
