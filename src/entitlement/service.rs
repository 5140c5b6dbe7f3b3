use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config;
use crate::error::{AppError, AppResult};

use super::catalog::PlanCatalog;
use super::counter::UsageCounter;
use super::models::{
    ConsumeDecision, EntitlementStatus, Plan, SubscribeOutcome, Subscription, SubscriptionStatus,
};
use super::subscriptions::SubscriptionStore;

/// key: entitlement-service -> quota gate and self-service lifecycle
///
/// The only entry point external collaborators call. Resolves the account's
/// current subscription (materializing the free-plan binding lazily), applies
/// any due rollover, and gates consumption through the atomic counter.
#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    store: SubscriptionStore,
    counter: UsageCounter,
    catalog: PlanCatalog,
    grace_days: i64,
    retry_limit: u32,
}

impl EntitlementService {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(
            pool,
            *config::PAST_DUE_GRACE_DAYS,
            *config::OPTIMISTIC_RETRY_LIMIT,
        )
    }

    pub fn with_policy(pool: PgPool, grace_days: i64, retry_limit: u32) -> Self {
        Self {
            store: SubscriptionStore::new(pool.clone()),
            counter: UsageCounter::new(pool.clone()),
            catalog: PlanCatalog::new(pool.clone()),
            pool,
            grace_days,
            retry_limit,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub(crate) fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    pub(crate) fn counter(&self) -> &UsageCounter {
        &self.counter
    }

    pub(crate) fn grace_days(&self) -> i64 {
        self.grace_days
    }

    /// Answer "may this account consume `amount` more units right now", and
    /// consume them if so. The quota check is never skipped; an account
    /// without a subscription gets the free plan on the spot. A denial is a
    /// first-class outcome, not an error.
    pub async fn check_and_consume(
        &self,
        account_id: i32,
        amount: i64,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<ConsumeDecision> {
        if amount <= 0 {
            return Err(AppError::validation("amount", "must be a positive integer"));
        }

        if let Some(key) = idempotency_key {
            if let Some(replayed) = self.find_receipt(account_id, key).await? {
                return Ok(replayed);
            }
        }

        let (subscription, plan) = self
            .store
            .ensure_current(account_id, now, self.grace_days)
            .await?;

        let outcome = self
            .counter
            .try_consume(
                subscription.id,
                subscription.period_start,
                subscription.period_quota,
                amount,
            )
            .await?;

        let decision = ConsumeDecision {
            allowed: outcome.allowed,
            remaining: outcome.remaining,
            plan: plan.name.clone(),
        };

        if let Some(key) = idempotency_key {
            self.record_receipt(account_id, key, &decision).await?;
        }

        info!(
            account_id,
            subscription = %subscription.id,
            allowed = decision.allowed,
            remaining = decision.remaining,
            plan = %decision.plan,
            "consumption checked"
        );
        Ok(decision)
    }

    /// Self-service first subscription or plan change. Asking for the plan the
    /// account already holds is reported, not failed.
    pub async fn subscribe(
        &self,
        account_id: i32,
        plan_id: uuid::Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<SubscribeOutcome> {
        let mut tx = self.pool.begin().await?;
        let (subscription, _current_plan) = self
            .store
            .ensure_current_in(&mut tx, account_id, now, self.grace_days)
            .await?;

        if subscription.plan_id == plan_id {
            // Resolution may have rolled the period; keep that work.
            tx.commit().await?;
            return Ok(SubscribeOutcome::AlreadySubscribed { plan_id });
        }

        match subscription.status {
            SubscriptionStatus::Active => {}
            SubscriptionStatus::PastDue => {
                return Err(AppError::Ineligible(
                    "subscription is past_due; settle the outstanding payment before changing plans"
                        .into(),
                ))
            }
            SubscriptionStatus::Cancelled => {
                return Err(AppError::Ineligible(
                    "subscription is cancelled; it keeps its plan until the period ends".into(),
                ))
            }
            SubscriptionStatus::Expired => {
                return Err(AppError::Ineligible("subscription is expired".into()))
            }
        }

        let target = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&mut tx)
            .await?
            .ok_or(AppError::NotFound)?;
        if !target.active {
            return Err(AppError::validation(
                "plan_id",
                "plan is retired and not open for subscription",
            ));
        }

        let updated = self.store.swap_plan_in(&mut tx, subscription.id, &target).await?;
        tx.commit().await?;

        info!(
            account_id,
            subscription = %updated.id,
            plan = %target.name,
            quota = target.monthly_quota,
            "plan changed"
        );
        Ok(SubscribeOutcome::Subscribed { plan: target })
    }

    /// Cancellation defers to period end: the account keeps its plan and
    /// quota until the current window closes, then falls back to free.
    pub async fn cancel(&self, account_id: i32, now: DateTime<Utc>) -> AppResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let (subscription, _plan) = self
            .store
            .ensure_current_in(&mut tx, account_id, now, self.grace_days)
            .await?;

        if subscription.status == SubscriptionStatus::Cancelled {
            tx.commit().await?;
            return Ok(subscription);
        }
        if !subscription.status.can_transition(SubscriptionStatus::Cancelled) {
            return Err(AppError::Ineligible(format!(
                "cannot cancel a {} subscription",
                subscription.status
            )));
        }

        let updated = self.store.mark_cancelled_in(&mut tx, subscription.id, now).await?;
        tx.commit().await?;
        info!(
            account_id,
            subscription = %updated.id,
            effective = %updated.period_end,
            "subscription cancelled, entitlement retained until period end"
        );
        Ok(updated)
    }

    /// Read-only composite view for dashboards. Shares the resolution path
    /// with consumption, so a lapsed period rolls over here too.
    pub async fn get_status(
        &self,
        account_id: i32,
        now: DateTime<Utc>,
    ) -> AppResult<EntitlementStatus> {
        let (subscription, plan) = self
            .store
            .ensure_current(account_id, now, self.grace_days)
            .await?;
        let usage = self
            .counter
            .get_usage(
                subscription.id,
                subscription.period_start,
                subscription.period_quota,
            )
            .await?;
        Ok(EntitlementStatus {
            plan,
            status: subscription.status,
            usage,
            period_end: subscription.period_end,
        })
    }

    /// Billing-provider failure signal: `active -> past_due`. Idempotent for
    /// repeated deliveries of the same event.
    pub async fn payment_failed(&self, account_id: i32, now: DateTime<Utc>) -> AppResult<()> {
        self.transition_from_event(account_id, SubscriptionStatus::PastDue, Some(now))
            .await
    }

    /// Late payment landed: `past_due -> active`.
    pub async fn payment_succeeded(&self, account_id: i32) -> AppResult<()> {
        self.transition_from_event(account_id, SubscriptionStatus::Active, None)
            .await
    }

    async fn transition_from_event(
        &self,
        account_id: i32,
        to: SubscriptionStatus,
        past_due_since: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        for _attempt in 0..self.retry_limit {
            let Some(subscription) = self.store.find_live(account_id).await? else {
                warn!(account_id, target = %to, "payment event for account without live subscription");
                return Ok(());
            };
            if subscription.status == to {
                return Ok(());
            }
            if !subscription.status.can_transition(to) {
                warn!(
                    account_id,
                    from = %subscription.status,
                    target = %to,
                    "payment event ignored, transition not legal"
                );
                return Ok(());
            }
            if self
                .store
                .try_transition(subscription.id, subscription.version, to, past_due_since)
                .await?
            {
                info!(account_id, subscription = %subscription.id, status = %to, "payment event applied");
                return Ok(());
            }
            // Version moved under us; re-read and try again.
        }
        Err(AppError::Conflict)
    }

    async fn find_receipt(
        &self,
        account_id: i32,
        key: &str,
    ) -> AppResult<Option<ConsumeDecision>> {
        let row: Option<(bool, i64, String)> = sqlx::query_as(
            "SELECT allowed, remaining, plan FROM consumption_receipts WHERE account_id = $1 AND idempotency_key = $2",
        )
        .bind(account_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(allowed, remaining, plan)| ConsumeDecision {
            allowed,
            remaining,
            plan,
        }))
    }

    async fn record_receipt(
        &self,
        account_id: i32,
        key: &str,
        decision: &ConsumeDecision,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO consumption_receipts (account_id, idempotency_key, allowed, remaining, plan)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(key)
        .bind(decision.allowed)
        .bind(decision.remaining)
        .bind(&decision.plan)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
