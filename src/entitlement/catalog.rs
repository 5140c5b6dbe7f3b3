use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::models::{Plan, PlanFeatures, FREE_PLAN_NAME};

/// key: plan-catalog -> purchasable tiers
///
/// Pure data plus validation over the `plans` table. Mutations are reachable
/// only through the admin service; retiring a plan never touches the
/// subscriptions already bound to it.
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PlanSpec {
    pub name: String,
    pub monthly_quota: i64,
    #[serde(default)]
    pub price_cents: i64,
    #[serde(default)]
    pub features: PlanFeatures,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PlanPatch {
    pub name: Option<String>,
    pub monthly_quota: Option<i64>,
    pub price_cents: Option<i64>,
    pub features: Option<PlanFeatures>,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_plan(&self, id: Uuid) -> AppResult<Plan> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// The seeded fallback plan. Its absence is a deployment defect, not a
    /// caller mistake.
    pub async fn free_plan(&self) -> AppResult<Plan> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE LOWER(name) = $1")
            .bind(FREE_PLAN_NAME)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::Message("free plan missing from catalog".into()))
    }

    /// Finite snapshot of purchasable plans, cheapest first. Ties break on
    /// name so the ordering is stable across calls.
    pub async fn list_active(&self) -> AppResult<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(
            "SELECT * FROM plans WHERE active = TRUE ORDER BY price_cents ASC, name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    pub async fn create_plan(&self, spec: PlanSpec) -> AppResult<Plan> {
        let name = normalized_name(&spec.name)?;
        if name.eq_ignore_ascii_case(FREE_PLAN_NAME) {
            return Err(AppError::validation("name", "\"free\" is reserved"));
        }
        validate_quota(spec.monthly_quota)?;
        validate_price(spec.price_cents)?;

        let result = sqlx::query_as::<_, Plan>(
            r#"
            INSERT INTO plans (id, name, monthly_quota, price_cents, features)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&name)
        .bind(spec.monthly_quota)
        .bind(spec.price_cents)
        .bind(Json(spec.features))
        .fetch_one(&self.pool)
        .await;

        result.map_err(duplicate_name_to_validation)
    }

    pub async fn update_plan(&self, id: Uuid, patch: PlanPatch) -> AppResult<Plan> {
        let current = self.get_plan(id).await?;

        let name = match patch.name {
            Some(raw) => Some(normalized_name(&raw)?),
            None => None,
        };
        if let Some(quota) = patch.monthly_quota {
            validate_quota(quota)?;
        }
        if let Some(price) = patch.price_cents {
            validate_price(price)?;
        }
        if current.is_free() {
            if name.as_deref().is_some_and(|n| !n.eq_ignore_ascii_case(FREE_PLAN_NAME)) {
                return Err(AppError::validation("name", "the free plan cannot be renamed"));
            }
            if patch.price_cents.is_some_and(|price| price != 0) {
                return Err(AppError::validation("price_cents", "the free plan must stay free"));
            }
        } else if name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(FREE_PLAN_NAME)) {
            return Err(AppError::validation("name", "\"free\" is reserved"));
        }

        // Quota/price edits never reach subscriptions already inside their
        // period; the snapshot on the subscription row is what gates them.
        let result = sqlx::query_as::<_, Plan>(
            r#"
            UPDATE plans SET
                name = COALESCE($2, name),
                monthly_quota = COALESCE($3, monthly_quota),
                price_cents = COALESCE($4, price_cents),
                features = COALESCE($5, features),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(patch.monthly_quota)
        .bind(patch.price_cents)
        .bind(patch.features.map(Json))
        .fetch_one(&self.pool)
        .await;

        result.map_err(duplicate_name_to_validation)
    }

    /// Blocks new self-service subscriptions to the plan; existing bindings
    /// keep running. Idempotent.
    pub async fn retire_plan(&self, id: Uuid) -> AppResult<()> {
        let plan = self.get_plan(id).await?;
        if plan.is_free() {
            return Err(AppError::validation("id", "the free plan cannot be retired"));
        }
        sqlx::query("UPDATE plans SET active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn normalized_name(raw: &str) -> AppResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppError::validation("name", "must not be empty"));
    }
    Ok(name.to_string())
}

fn validate_quota(quota: i64) -> AppResult<()> {
    if quota <= 0 {
        return Err(AppError::validation("monthly_quota", "must be a positive integer"));
    }
    Ok(())
}

fn validate_price(price_cents: i64) -> AppResult<()> {
    if price_cents < 0 {
        return Err(AppError::validation("price_cents", "must not be negative"));
    }
    Ok(())
}

fn duplicate_name_to_validation(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.constraint() == Some("plans_name_key") {
            return AppError::validation("name", "a plan with this name already exists");
        }
    }
    AppError::Db(err)
}
