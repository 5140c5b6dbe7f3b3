use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, warn};

use crate::config;

use super::subscriptions::SubscriptionStore;

/// key: renewal-scheduler -> proactive rollover and grace expiry
///
/// The lazy, read-triggered resolution already rolls periods and expires
/// lapsed grace windows; this worker just visits due accounts ahead of their
/// next request through the exact same store path, so both produce identical
/// state and the tick is idempotent.
pub fn spawn(pool: PgPool) {
    let interval = TokioDuration::from_secs(*config::RENEWAL_SCAN_INTERVAL_SECS);
    let grace_days = *config::PAST_DUE_GRACE_DAYS;

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(err) = process_tick(&pool, now, grace_days).await {
                warn!(?err, "entitlement renewal tick failed");
            }
        }
    });
}

pub async fn process_tick(pool: &PgPool, now: DateTime<Utc>, grace_days: i64) -> Result<()> {
    let store = SubscriptionStore::new(pool.clone());
    let grace_cutoff = now - Duration::days(grace_days);

    let due_accounts: Vec<i32> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT s.account_id
        FROM subscriptions s
        WHERE (
                (s.status IN ('active', 'cancelled') AND s.period_end <= $1)
                OR (s.status = 'past_due' AND s.past_due_since <= $2)
              )
          AND NOT EXISTS (
                SELECT 1 FROM subscriptions n
                WHERE n.account_id = s.account_id
                  AND n.created_at > s.created_at
                  AND n.status IN ('active', 'past_due')
              )
        "#,
    )
    .bind(now)
    .bind(grace_cutoff)
    .fetch_all(pool)
    .await?;

    if due_accounts.is_empty() {
        debug!("no subscriptions due for renewal handling");
        return Ok(());
    }

    for account_id in due_accounts {
        if let Err(err) = store.ensure_current(account_id, now, grace_days).await {
            warn!(?err, account_id, "failed to advance subscription state");
        }
    }

    Ok(())
}
