use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, QueryBuilder};
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::catalog::{PlanPatch, PlanSpec};
use super::models::{Plan, Subscription, SubscriptionStatus};
use super::service::EntitlementService;

/// key: admin-override -> privileged corrections
///
/// Privileged operations that bypass the self-service transition rules but
/// never the invariants: forced plan changes still land on existing, active
/// plans, and usage resets always leave a correction entry behind.
#[derive(Clone)]
pub struct AdminOverrideService {
    service: EntitlementService,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionFilter {
    pub status: Option<SubscriptionStatus>,
    pub account_id: Option<i32>,
    pub plan_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub per_page: Option<i64>,
}

impl Page {
    fn limit(&self) -> i64 {
        self.per_page.unwrap_or(25).clamp(1, 100)
    }

    fn offset(&self) -> i64 {
        self.page.max(0) * self.limit()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AdminSubscriptionRow {
    pub id: Uuid,
    pub account_id: i32,
    pub plan_id: Uuid,
    pub plan_name: String,
    pub status: SubscriptionStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub period_quota: i64,
    pub created_at: DateTime<Utc>,
}

impl AdminOverrideService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            service: EntitlementService::new(pool),
        }
    }

    pub fn from_service(service: EntitlementService) -> Self {
        Self { service }
    }

    /// Zero the account's counter for its current period. The reason is
    /// mandatory and lands in the correction audit trail together with the
    /// acting principal.
    pub async fn force_reset_usage(
        &self,
        account_id: i32,
        reason: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if reason.trim().is_empty() {
            return Err(AppError::validation("reason", "must not be empty"));
        }
        let (subscription, _plan) = self
            .service
            .store()
            .ensure_current(account_id, now, self.service.grace_days())
            .await?;
        self.service
            .counter()
            .reset_usage(subscription.id, subscription.period_start, reason.trim(), actor)
            .await?;
        info!(
            account_id,
            subscription = %subscription.id,
            actor,
            reason = reason.trim(),
            "usage counter reset by admin"
        );
        Ok(())
    }

    /// Rebind the account to `plan_id` regardless of self-service transition
    /// rules (a past_due account can be moved). The target plan must still
    /// exist and be active. On a live row the plan is swapped in place,
    /// quota snapshot included; a terminal row is left as history and a
    /// fresh subscription is opened instead.
    pub async fn force_set_plan(
        &self,
        account_id: i32,
        plan_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Subscription> {
        let plan = self.service.catalog().get_plan(plan_id).await?;
        if !plan.active {
            return Err(AppError::validation("plan_id", "plan is retired"));
        }

        let mut tx = self.service.store().pool().begin().await?;
        let (subscription, _current_plan) = self
            .service
            .store()
            .ensure_current_in(&mut tx, account_id, now, self.service.grace_days())
            .await?;

        let updated = if subscription.status.is_terminal() {
            self.service
                .store()
                .start_subscription_in(&mut tx, account_id, &plan, now)
                .await?
        } else {
            self.service
                .store()
                .swap_plan_in(&mut tx, subscription.id, &plan)
                .await?
        };
        tx.commit().await?;

        info!(
            account_id,
            subscription = %updated.id,
            plan = %plan.name,
            "plan forced by admin"
        );
        Ok(updated)
    }

    pub async fn create_plan(&self, spec: PlanSpec) -> AppResult<Plan> {
        self.service.catalog().create_plan(spec).await
    }

    pub async fn update_plan(&self, id: Uuid, patch: PlanPatch) -> AppResult<Plan> {
        self.service.catalog().update_plan(id, patch).await
    }

    pub async fn retire_plan(&self, id: Uuid) -> AppResult<()> {
        self.service.catalog().retire_plan(id).await
    }

    /// Paginated cross-account view, newest first.
    pub async fn list_subscriptions(
        &self,
        filter: SubscriptionFilter,
        page: Page,
    ) -> AppResult<Vec<AdminSubscriptionRow>> {
        let mut builder = QueryBuilder::new(
            "SELECT s.id, s.account_id, s.plan_id, p.name AS plan_name, s.status, \
             s.period_start, s.period_end, s.period_quota, s.created_at \
             FROM subscriptions s JOIN plans p ON p.id = s.plan_id WHERE TRUE ",
        );
        if let Some(status) = filter.status {
            builder.push("AND s.status = ");
            builder.push_bind(status);
            builder.push(" ");
        }
        if let Some(account_id) = filter.account_id {
            builder.push("AND s.account_id = ");
            builder.push_bind(account_id);
            builder.push(" ");
        }
        if let Some(plan_id) = filter.plan_id {
            builder.push("AND s.plan_id = ");
            builder.push_bind(plan_id);
            builder.push(" ");
        }
        builder.push("ORDER BY s.created_at DESC LIMIT ");
        builder.push_bind(page.limit());
        builder.push(" OFFSET ");
        builder.push_bind(page.offset());

        let rows = builder
            .build_query_as::<AdminSubscriptionRow>()
            .fetch_all(self.service.store().pool())
            .await?;
        Ok(rows)
    }
}
