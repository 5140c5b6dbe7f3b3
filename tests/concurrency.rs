use chrono::{Duration, Utc};
use metering::entitlement::{EntitlementService, UsageCounter};
use sqlx::PgPool;
use uuid::Uuid;

// key: concurrency-tests -> racing consumers never oversell a quota

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn racing_consumers_get_exactly_the_remaining_units(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let service = EntitlementService::with_policy(pool.clone(), 3, 3);

    // Free quota is 8; burn 5 so exactly 3 units remain.
    let warmup = service
        .check_and_consume(401, 5, None, Utc::now())
        .await
        .unwrap();
    assert!(warmup.allowed);
    assert_eq!(warmup.remaining, 3);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .check_and_consume(401, 1, None, Utc::now())
                .await
                .unwrap()
                .allowed
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 3, "exactly the remaining units may be granted");

    let status = service.get_status(401, Utc::now()).await.unwrap();
    assert_eq!(status.usage.consumed, 8, "counter must never exceed quota");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn lazy_record_creation_admits_a_single_winner(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    // A subscription whose period has no usage record yet and a single unit
    // of quota: the first-use-in-period race.
    let plan_id = Uuid::new_v4();
    sqlx::query("INSERT INTO plans (id, name, monthly_quota, price_cents) VALUES ($1, 'solo', 1, 0)")
        .bind(plan_id)
        .execute(&pool)
        .await
        .unwrap();

    let subscription_id = Uuid::new_v4();
    let period_start = Utc::now() - Duration::days(1);
    let period_end = Utc::now() + Duration::days(29);
    sqlx::query(
        r#"
        INSERT INTO subscriptions
            (id, account_id, plan_id, status, period_start, period_end, period_quota)
        VALUES ($1, $2, $3, 'active', $4, $5, 1)
        "#,
    )
    .bind(subscription_id)
    .bind(402)
    .bind(plan_id)
    .bind(period_start)
    .bind(period_end)
    .execute(&pool)
    .await
    .unwrap();

    let counter = UsageCounter::new(pool.clone());
    let a = {
        let counter = counter.clone();
        tokio::spawn(async move { counter.try_consume(subscription_id, period_start, 1, 1).await })
    };
    let b = {
        let counter = counter.clone();
        tokio::spawn(async move { counter.try_consume(subscription_id, period_start, 1, 1).await })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert!(
        a.allowed ^ b.allowed,
        "exactly one of the two lazy creators may win, got {a:?} / {b:?}"
    );

    let consumed: i64 = sqlx::query_scalar(
        "SELECT consumed FROM usage_records WHERE subscription_id = $1 AND period_start = $2",
    )
    .bind(subscription_id)
    .bind(period_start)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(consumed, 1, "no lost update between the lazy creations");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn oversized_requests_cannot_sneak_past_the_guard(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let service = EntitlementService::with_policy(pool.clone(), 3, 3);
    let denied = service
        .check_and_consume(403, 9, None, Utc::now())
        .await
        .unwrap();
    assert!(!denied.allowed, "a request above the whole quota is denied");
    assert_eq!(denied.remaining, 8);

    let partial = service
        .check_and_consume(403, 8, None, Utc::now())
        .await
        .unwrap();
    assert!(partial.allowed);
    assert_eq!(partial.remaining, 0);
}
