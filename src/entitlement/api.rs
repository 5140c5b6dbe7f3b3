use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

use super::adapters::{verify_signature, BillingProviderAdapter, StripeLikeAdapter};
use super::admin::{AdminOverrideService, AdminSubscriptionRow, Page, SubscriptionFilter};
use super::catalog::{PlanCatalog, PlanPatch, PlanSpec};
use super::models::{
    ConsumeDecision, EntitlementStatus, Plan, SubscribeOutcome, SubscriptionStatus,
};
use super::service::EntitlementService;

/// key: entitlement-api -> rest endpoints
pub async fn list_plans(Extension(pool): Extension<PgPool>) -> AppResult<Json<Vec<Plan>>> {
    let plans = PlanCatalog::new(pool).list_active().await?;
    Ok(Json(plans))
}

pub async fn get_entitlement(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(account_id): Path<i32>,
) -> AppResult<Json<EntitlementStatus>> {
    authorize_account(&user, account_id)?;
    let status = EntitlementService::new(pool)
        .get_status(account_id, Utc::now())
        .await?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub async fn consume(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(account_id): Path<i32>,
    Json(payload): Json<ConsumeRequest>,
) -> AppResult<(StatusCode, Json<ConsumeDecision>)> {
    authorize_account(&user, account_id)?;
    let decision = EntitlementService::new(pool)
        .check_and_consume(
            account_id,
            payload.amount.unwrap_or(1),
            payload.idempotency_key.as_deref(),
            Utc::now(),
        )
        .await?;
    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    Ok((status, Json(decision)))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: Uuid,
}

pub async fn subscribe(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(account_id): Path<i32>,
    Json(payload): Json<SubscribeRequest>,
) -> AppResult<Json<SubscribeOutcome>> {
    authorize_account(&user, account_id)?;
    let outcome = EntitlementService::new(pool)
        .subscribe(account_id, payload.plan_id, Utc::now())
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub status: SubscriptionStatus,
    pub plan_id: Uuid,
    pub effective_at: DateTime<Utc>,
}

pub async fn cancel(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(account_id): Path<i32>,
) -> AppResult<Json<CancelResponse>> {
    authorize_account(&user, account_id)?;
    let subscription = EntitlementService::new(pool)
        .cancel(account_id, Utc::now())
        .await?;
    Ok(Json(CancelResponse {
        status: subscription.status,
        plan_id: subscription.plan_id,
        effective_at: subscription.period_end,
    }))
}

/// Billing-provider callback. Authenticated by an HMAC-SHA256 digest of the
/// raw body, not by a user token.
pub async fn billing_events(
    Extension(pool): Extension<PgPool>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> AppResult<StatusCode> {
    let signature = headers
        .get("x-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::validation("x-signature-256", "missing signature header"))?;
    if !verify_signature(config::BILLING_WEBHOOK_SECRET.as_str(), &body, signature) {
        return Err(AppError::Unauthorized);
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::validation("body", format!("malformed event payload: {e}")))?;
    let service = EntitlementService::new(pool);
    StripeLikeAdapter
        .apply(&service, payload, Utc::now())
        .await
        .map_err(|e| AppError::Message(e.to_string()))?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct ResetUsageRequest {
    pub reason: String,
}

pub async fn admin_reset_usage(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(account_id): Path<i32>,
    Json(payload): Json<ResetUsageRequest>,
) -> AppResult<StatusCode> {
    require_admin(&user)?;
    AdminOverrideService::new(pool)
        .force_reset_usage(
            account_id,
            &payload.reason,
            &user.account_id.to_string(),
            Utc::now(),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ForcePlanRequest {
    pub plan_id: Uuid,
}

pub async fn admin_set_plan(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(account_id): Path<i32>,
    Json(payload): Json<ForcePlanRequest>,
) -> AppResult<StatusCode> {
    require_admin(&user)?;
    AdminOverrideService::new(pool)
        .force_set_plan(account_id, payload.plan_id, Utc::now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn admin_create_plan(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Json(spec): Json<PlanSpec>,
) -> AppResult<(StatusCode, Json<Plan>)> {
    require_admin(&user)?;
    let plan = AdminOverrideService::new(pool).create_plan(spec).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn admin_update_plan(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(patch): Json<PlanPatch>,
) -> AppResult<Json<Plan>> {
    require_admin(&user)?;
    let plan = AdminOverrideService::new(pool).update_plan(id, patch).await?;
    Ok(Json(plan))
}

/// DELETE maps to retirement; plan rows are never physically removed.
pub async fn admin_retire_plan(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    require_admin(&user)?;
    AdminOverrideService::new(pool).retire_plan(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ListSubscriptionsParams {
    #[serde(default)]
    pub status: Option<SubscriptionStatus>,
    #[serde(default)]
    pub account_id: Option<i32>,
    #[serde(default)]
    pub plan_id: Option<Uuid>,
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub per_page: Option<i64>,
}

pub async fn admin_list_subscriptions(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Query(params): Query<ListSubscriptionsParams>,
) -> AppResult<Json<Vec<AdminSubscriptionRow>>> {
    require_admin(&user)?;
    let filter = SubscriptionFilter {
        status: params.status,
        account_id: params.account_id,
        plan_id: params.plan_id,
    };
    let page = Page {
        page: params.page,
        per_page: params.per_page,
    };
    let rows = AdminOverrideService::new(pool)
        .list_subscriptions(filter, page)
        .await?;
    Ok(Json(rows))
}

fn authorize_account(user: &AuthUser, account_id: i32) -> AppResult<()> {
    if user.account_id == account_id || user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

fn require_admin(user: &AuthUser) -> AppResult<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}
