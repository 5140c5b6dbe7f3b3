use chrono::{DateTime, Duration, Months, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::models::{Plan, PlanFeatures, Subscription, SubscriptionStatus, FREE_PLAN_NAME};

/// key: subscription-store -> locked resolution and rollover
///
/// Owns every write to the `subscriptions` table. Resolution takes a row-level
/// lock on the account's current subscription and applies any due rollover or
/// grace expiry before returning, so the caller always sees a window that
/// contains `now` (or a terminal row that was just replaced by a free one).
/// Two different accounts never contend with each other.
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve the account's current subscription, lazily materializing the
    /// free-plan binding if the account has none, and rolling the period
    /// forward when it has lapsed. Rollover is idempotent: a second call
    /// right after a period boundary observes the already-advanced window
    /// and changes nothing.
    pub async fn ensure_current(
        &self,
        account_id: i32,
        now: DateTime<Utc>,
        grace_days: i64,
    ) -> AppResult<(Subscription, Plan)> {
        // Two first-ever requests for the same account can race the free-plan
        // insert; the loser hits the one-live-row index and wins on re-read.
        for _attempt in 0..2 {
            let mut tx = self.pool.begin().await?;
            match self
                .ensure_current_in(&mut tx, account_id, now, grace_days)
                .await
            {
                Ok(resolved) => {
                    tx.commit().await?;
                    return Ok(resolved);
                }
                Err(AppError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(AppError::Conflict)
    }

    pub(crate) async fn ensure_current_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: i32,
        now: DateTime<Utc>,
        grace_days: i64,
    ) -> AppResult<(Subscription, Plan)> {
        let Some((subscription, plan)) = current_with_plan(tx, account_id).await? else {
            let free = free_plan(tx).await?;
            let (start, end) = (now, next_cycle_end(now));
            let created =
                insert_subscription(tx, account_id, &free, SubscriptionStatus::Active, start, end)
                    .await?;
            open_usage_record(tx, created.id, created.period_start).await?;
            return Ok((created, free));
        };

        match subscription.status {
            SubscriptionStatus::Active if subscription.period_end <= now => {
                let (start, end) =
                    advance_window(subscription.period_start, subscription.period_end, now);
                let rolled = sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions SET
                        period_start = $2,
                        period_end = $3,
                        period_quota = $4,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(subscription.id)
                .bind(start)
                .bind(end)
                .bind(plan.monthly_quota)
                .fetch_one(&mut *tx)
                .await?;
                open_usage_record(tx, rolled.id, rolled.period_start).await?;
                tracing::info!(
                    account_id,
                    subscription = %rolled.id,
                    period_start = %start,
                    "rolled subscription into new billing period"
                );
                Ok((rolled, plan))
            }
            SubscriptionStatus::Cancelled if subscription.period_end <= now => {
                // The cancelled row stays as history; entitlement falls back
                // to a fresh free-plan subscription picking up where the old
                // window closed.
                let free = free_plan(tx).await?;
                let (start, end) =
                    advance_window(subscription.period_end, next_cycle_end(subscription.period_end), now);
                let created =
                    insert_subscription(tx, account_id, &free, SubscriptionStatus::Active, start, end)
                        .await?;
                open_usage_record(tx, created.id, created.period_start).await?;
                tracing::info!(
                    account_id,
                    replaced = %subscription.id,
                    subscription = %created.id,
                    "cancelled subscription lapsed, account moved to free plan"
                );
                Ok((created, free))
            }
            SubscriptionStatus::PastDue
                if grace_deadline(&subscription, grace_days).is_some_and(|d| d <= now) =>
            {
                self.expire_and_fallback_in(tx, &subscription, now).await
            }
            _ => Ok((subscription, plan)),
        }
    }

    /// Terminal grace-period handling: mark the row expired and bind the
    /// account to a fresh free-plan subscription starting at expiry time.
    pub(crate) async fn expire_and_fallback_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> AppResult<(Subscription, Plan)> {
        sqlx::query(
            r#"
            UPDATE subscriptions SET status = 'expired', version = version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .execute(&mut *tx)
        .await?;

        let free = free_plan(tx).await?;
        let created = insert_subscription(
            tx,
            subscription.account_id,
            &free,
            SubscriptionStatus::Active,
            now,
            next_cycle_end(now),
        )
        .await?;
        open_usage_record(tx, created.id, created.period_start).await?;
        tracing::info!(
            account_id = subscription.account_id,
            expired = %subscription.id,
            subscription = %created.id,
            "past_due grace elapsed, subscription expired"
        );
        Ok((created, free))
    }

    /// Replace the plan binding on a live subscription. The consumed count
    /// carries over untouched; only the quota snapshot changes, effective
    /// immediately for the remainder of the period.
    pub(crate) async fn swap_plan_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Uuid,
        plan: &Plan,
    ) -> AppResult<Subscription> {
        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions SET
                plan_id = $2,
                period_quota = $3,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(plan.id)
        .bind(plan.monthly_quota)
        .fetch_one(&mut *tx)
        .await?;
        Ok(updated)
    }

    /// Open a brand-new active subscription for the account, bound to `plan`
    /// with a fresh period starting at `now`. Used when the current row is in
    /// a terminal state and cannot be mutated.
    pub(crate) async fn start_subscription_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: i32,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> AppResult<Subscription> {
        let created = insert_subscription(
            tx,
            account_id,
            plan,
            SubscriptionStatus::Active,
            now,
            next_cycle_end(now),
        )
        .await?;
        open_usage_record(tx, created.id, created.period_start).await?;
        Ok(created)
    }

    pub(crate) async fn mark_cancelled_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Subscription> {
        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions SET
                status = 'cancelled',
                canceled_at = $2,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        Ok(updated)
    }

    /// Non-locking read of the account's live subscription, used by the
    /// optimistic payment-event transitions.
    pub async fn find_live(&self, account_id: i32) -> AppResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE account_id = $1 AND status IN ('active', 'past_due')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    /// Versioned compare-and-swap status update. Returns false when another
    /// writer got there first; the caller re-reads and retries.
    pub async fn try_transition(
        &self,
        subscription_id: Uuid,
        expected_version: i32,
        to: SubscriptionStatus,
        past_due_since: Option<DateTime<Utc>>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = $3,
                past_due_since = $4,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(subscription_id)
        .bind(expected_version)
        .bind(to)
        .bind(past_due_since)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Lock and return the account's current subscription with its plan. History
/// rows in terminal states older than the current binding never surface here.
async fn current_with_plan(
    tx: &mut Transaction<'_, Postgres>,
    account_id: i32,
) -> AppResult<Option<(Subscription, Plan)>> {
    let row = sqlx::query(
        r#"
        SELECT
            s.id,
            s.account_id,
            s.plan_id,
            s.status,
            s.period_start,
            s.period_end,
            s.period_quota,
            s.past_due_since,
            s.canceled_at,
            s.version,
            s.created_at,
            s.updated_at,
            p.id AS plan_id_row,
            p.name,
            p.monthly_quota,
            p.price_cents,
            p.features,
            p.active,
            p.created_at AS plan_created_at,
            p.updated_at AS plan_updated_at
        FROM subscriptions s
        JOIN plans p ON p.id = s.plan_id
        WHERE s.account_id = $1 AND s.status IN ('active', 'past_due', 'cancelled')
        ORDER BY s.created_at DESC
        LIMIT 1
        FOR UPDATE OF s
        "#,
    )
    .bind(account_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let subscription = Subscription {
        id: row.get("id"),
        account_id: row.get("account_id"),
        plan_id: row.get("plan_id"),
        status: row.get("status"),
        period_start: row.get("period_start"),
        period_end: row.get("period_end"),
        period_quota: row.get("period_quota"),
        past_due_since: row.get("past_due_since"),
        canceled_at: row.get("canceled_at"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    };

    let plan = Plan {
        id: row.get("plan_id_row"),
        name: row.get("name"),
        monthly_quota: row.get("monthly_quota"),
        price_cents: row.get("price_cents"),
        features: row.get::<Json<PlanFeatures>, _>("features"),
        active: row.get("active"),
        created_at: row.get("plan_created_at"),
        updated_at: row.get("plan_updated_at"),
    };

    Ok(Some((subscription, plan)))
}

async fn free_plan(tx: &mut Transaction<'_, Postgres>) -> AppResult<Plan> {
    sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE LOWER(name) = $1")
        .bind(FREE_PLAN_NAME)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::Message("free plan missing from catalog".into()))
}

async fn insert_subscription(
    tx: &mut Transaction<'_, Postgres>,
    account_id: i32,
    plan: &Plan,
    status: SubscriptionStatus,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> AppResult<Subscription> {
    let result = sqlx::query_as::<_, Subscription>(
        r#"
        INSERT INTO subscriptions
            (id, account_id, plan_id, status, period_start, period_end, period_quota)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(plan.id)
    .bind(status)
    .bind(period_start)
    .bind(period_end)
    .bind(plan.monthly_quota)
    .fetch_one(&mut *tx)
    .await;

    result.map_err(|err| {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.constraint() == Some("subscriptions_one_live_per_account") {
                return AppError::Conflict;
            }
        }
        AppError::Db(err)
    })
}

async fn open_usage_record(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: Uuid,
    period_start: DateTime<Utc>,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO usage_records (subscription_id, period_start, consumed)
        VALUES ($1, $2, 0)
        ON CONFLICT (subscription_id, period_start) DO NOTHING
        "#,
    )
    .bind(subscription_id)
    .bind(period_start)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

/// One billing cycle past `start`. Calendar months, with a fixed-length
/// fallback at the extreme end of the representable range so callers never
/// observe a window that fails to advance.
pub(crate) fn next_cycle_end(start: DateTime<Utc>) -> DateTime<Utc> {
    start
        .checked_add_months(Months::new(1))
        .unwrap_or_else(|| start + Duration::days(30))
}

/// Advance a lapsed window by whole cycles until it contains `now`. Keeps
/// period boundaries contiguous for accounts that sat dormant across several
/// cycles.
pub(crate) fn advance_window(
    mut start: DateTime<Utc>,
    mut end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    while end <= now {
        start = end;
        end = next_cycle_end(start);
    }
    (start, end)
}

pub(crate) fn grace_deadline(
    subscription: &Subscription,
    grace_days: i64,
) -> Option<DateTime<Utc>> {
    subscription
        .past_due_since
        .map(|since| since + Duration::days(grace_days))
}
