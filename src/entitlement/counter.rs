use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::models::{ConsumeOutcome, UsageSummary};

/// key: usage-counter -> atomic per-period consumption
///
/// All increments go through a single guarded upsert, so lazy record creation
/// and the limit check share one statement. Two racers on the last unit get
/// exactly one success; the loser observes the guard failing and is denied.
#[derive(Clone)]
pub struct UsageCounter {
    pool: PgPool,
}

impl UsageCounter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Attempt to consume `amount` units against `quota` for the given
    /// period. A denial is a normal outcome, never an error.
    pub async fn try_consume(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        quota: i64,
        amount: i64,
    ) -> AppResult<ConsumeOutcome> {
        if amount <= 0 {
            return Err(AppError::validation("amount", "must be a positive integer"));
        }

        // A fresh record starts at zero, so amounts above the quota can never
        // succeed; skip straight to the denial without inserting anything.
        if amount > quota {
            let consumed = self.consumed(subscription_id, period_start).await?;
            return Ok(ConsumeOutcome {
                allowed: false,
                remaining: (quota - consumed).max(0),
            });
        }

        let consumed: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO usage_records (subscription_id, period_start, consumed, last_consumed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (subscription_id, period_start) DO UPDATE SET
                consumed = usage_records.consumed + EXCLUDED.consumed,
                last_consumed_at = NOW()
            WHERE usage_records.consumed + EXCLUDED.consumed <= $4
            RETURNING consumed
            "#,
        )
        .bind(subscription_id)
        .bind(period_start)
        .bind(amount)
        .bind(quota)
        .fetch_optional(&self.pool)
        .await?;

        match consumed {
            Some(consumed) => Ok(ConsumeOutcome {
                allowed: true,
                remaining: quota - consumed,
            }),
            None => {
                let consumed = self.consumed(subscription_id, period_start).await?;
                Ok(ConsumeOutcome {
                    allowed: false,
                    remaining: (quota - consumed).max(0),
                })
            }
        }
    }

    pub async fn get_usage(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        quota: i64,
    ) -> AppResult<UsageSummary> {
        let consumed = self.consumed(subscription_id, period_start).await?;
        Ok(UsageSummary { consumed, quota })
    }

    /// Materialize the zero-consumed record for a period that just opened.
    /// Harmless if a concurrent consume already created it.
    pub async fn ensure_record(
        &self,
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
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Administrative counter correction. Zeroes the record and appends the
    /// audit entry in the same transaction; history is never overwritten
    /// silently. Reachable only through the admin override service.
    pub(crate) async fn reset_usage(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        reason: &str,
        actor: &str,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<i64> = sqlx::query_scalar(
            "SELECT consumed FROM usage_records WHERE subscription_id = $1 AND period_start = $2 FOR UPDATE",
        )
        .bind(subscription_id)
        .bind(period_start)
        .fetch_optional(&mut tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO usage_records (subscription_id, period_start, consumed)
            VALUES ($1, $2, 0)
            ON CONFLICT (subscription_id, period_start) DO UPDATE SET consumed = 0
            "#,
        )
        .bind(subscription_id)
        .bind(period_start)
        .execute(&mut tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO usage_corrections
                (id, subscription_id, period_start, previous_consumed, reason, actor)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(period_start)
        .bind(previous.unwrap_or(0))
        .bind(reason)
        .bind(actor)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn consumed(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> AppResult<i64> {
        let consumed: Option<i64> = sqlx::query_scalar(
            "SELECT consumed FROM usage_records WHERE subscription_id = $1 AND period_start = $2",
        )
        .bind(subscription_id)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(consumed.unwrap_or(0))
    }
}
