use chrono::Utc;
use metering::entitlement::{
    AdminOverrideService, EntitlementService, Page, PlanPatch, PlanSpec, SubscriptionFilter,
    SubscriptionStatus,
};
use metering::error::AppError;
use sqlx::PgPool;
use uuid::Uuid;

// key: admin-override-tests -> audited resets, forced plans, plan crud

fn spec(name: &str, quota: i64, price_cents: i64) -> PlanSpec {
    PlanSpec {
        name: name.to_string(),
        monthly_quota: quota,
        price_cents,
        features: Default::default(),
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn usage_reset_zeroes_counter_and_leaves_audit_entry(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let service = EntitlementService::with_policy(pool.clone(), 3, 3);
    let admin = AdminOverrideService::from_service(service.clone());

    let pro = admin.create_plan(spec("pro", 100, 1900)).await.unwrap();
    service.subscribe(201, pro.id, Utc::now()).await.unwrap();
    service
        .check_and_consume(201, 50, None, Utc::now())
        .await
        .unwrap();

    admin
        .force_reset_usage(201, "support credit for failed scans", "9", Utc::now())
        .await
        .unwrap();

    let status = service.get_status(201, Utc::now()).await.unwrap();
    assert_eq!(status.usage.consumed, 0);
    assert_eq!(status.usage.quota, 100);

    let (previous, reason, actor): (i64, String, String) = sqlx::query_as(
        r#"
        SELECT c.previous_consumed, c.reason, c.actor
        FROM usage_corrections c
        JOIN subscriptions s ON s.id = c.subscription_id
        WHERE s.account_id = $1
        "#,
    )
    .bind(201)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(previous, 50);
    assert_eq!(reason, "support credit for failed scans");
    assert_eq!(actor, "9");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn usage_reset_requires_a_reason(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let admin = AdminOverrideService::new(pool.clone());
    let err = admin
        .force_reset_usage(202, "   ", "9", Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { field: "reason", .. }));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn forced_plan_change_moves_a_past_due_account(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let service = EntitlementService::with_policy(pool.clone(), 3, 3);
    let admin = AdminOverrideService::from_service(service.clone());
    let pro = admin.create_plan(spec("pro", 100, 1900)).await.unwrap();
    let basic = admin.create_plan(spec("basic", 20, 500)).await.unwrap();

    service.subscribe(203, pro.id, Utc::now()).await.unwrap();
    service.payment_failed(203, Utc::now()).await.unwrap();

    // Self-service would refuse this; the override must not.
    let updated = admin.force_set_plan(203, basic.id, Utc::now()).await.unwrap();
    assert_eq!(updated.plan_id, basic.id);
    assert_eq!(updated.period_quota, 20);
    assert_eq!(updated.status, SubscriptionStatus::PastDue);

    // A retired target is still off limits.
    admin.retire_plan(pro.id).await.unwrap();
    let err = admin.force_set_plan(203, pro.id, Utc::now()).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { field: "plan_id", .. }));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn plan_validation_rejects_bad_specs(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let admin = AdminOverrideService::new(pool.clone());

    let err = admin.create_plan(spec("pro", 0, 1900)).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { field: "monthly_quota", .. }));

    let err = admin.create_plan(spec("pro", 100, -5)).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { field: "price_cents", .. }));

    let err = admin.create_plan(spec("  ", 100, 0)).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { field: "name", .. }));

    let err = admin.create_plan(spec("Free", 100, 0)).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { field: "name", .. }));

    admin.create_plan(spec("pro", 100, 1900)).await.unwrap();
    let err = admin.create_plan(spec("PRO", 50, 900)).await.unwrap_err();
    assert!(
        matches!(err, AppError::Validation { field: "name", .. }),
        "plan names are unique case-insensitively"
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn free_plan_protections_hold(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let admin = AdminOverrideService::new(pool.clone());
    let free_id: Uuid = sqlx::query_scalar("SELECT id FROM plans WHERE name = 'free'")
        .fetch_one(&pool)
        .await
        .unwrap();

    let err = admin.retire_plan(free_id).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { .. }));

    let err = admin
        .update_plan(
            free_id,
            PlanPatch {
                price_cents: Some(900),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { field: "price_cents", .. }));

    let err = admin
        .update_plan(
            free_id,
            PlanPatch {
                name: Some("starter".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { field: "name", .. }));

    // Raising the free quota is legitimate.
    let updated = admin
        .update_plan(
            free_id,
            PlanPatch {
                monthly_quota: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.monthly_quota, 10);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn quota_edits_do_not_touch_open_periods(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let service = EntitlementService::with_policy(pool.clone(), 3, 3);
    let admin = AdminOverrideService::from_service(service.clone());
    let pro = admin.create_plan(spec("pro", 100, 1900)).await.unwrap();
    service.subscribe(204, pro.id, Utc::now()).await.unwrap();

    admin
        .update_plan(
            pro.id,
            PlanPatch {
                monthly_quota: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The period keeps its snapshot until rollover.
    let status = service.get_status(204, Utc::now()).await.unwrap();
    assert_eq!(status.usage.quota, 100);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn retire_is_idempotent_and_preserves_bindings(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let service = EntitlementService::with_policy(pool.clone(), 3, 3);
    let admin = AdminOverrideService::from_service(service.clone());
    let pro = admin.create_plan(spec("pro", 100, 1900)).await.unwrap();
    service.subscribe(205, pro.id, Utc::now()).await.unwrap();

    admin.retire_plan(pro.id).await.unwrap();
    admin.retire_plan(pro.id).await.unwrap();

    let status = service.get_status(205, Utc::now()).await.unwrap();
    assert_eq!(status.plan.name, "pro", "existing binding survives retirement");
    let decision = service
        .check_and_consume(205, 1, None, Utc::now())
        .await
        .unwrap();
    assert!(decision.allowed);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn subscription_listing_filters_and_paginates(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let service = EntitlementService::with_policy(pool.clone(), 3, 3);
    let admin = AdminOverrideService::from_service(service.clone());
    let pro = admin.create_plan(spec("pro", 100, 1900)).await.unwrap();

    for account_id in 301..306 {
        service.subscribe(account_id, pro.id, Utc::now()).await.unwrap();
    }
    service.cancel(301, Utc::now()).await.unwrap();

    let cancelled = admin
        .list_subscriptions(
            SubscriptionFilter {
                status: Some(SubscriptionStatus::Cancelled),
                ..Default::default()
            },
            Page { page: 0, per_page: None },
        )
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].account_id, 301);
    assert_eq!(cancelled[0].plan_name, "pro");

    let page_one = admin
        .list_subscriptions(
            SubscriptionFilter::default(),
            Page { page: 0, per_page: Some(2) },
        )
        .await
        .unwrap();
    let page_two = admin
        .list_subscriptions(
            SubscriptionFilter::default(),
            Page { page: 1, per_page: Some(2) },
        )
        .await
        .unwrap();
    assert_eq!(page_one.len(), 2);
    assert_eq!(page_two.len(), 2);
    assert!(page_one.iter().all(|row| page_two.iter().all(|o| o.id != row.id)));
}
