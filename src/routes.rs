use axum::{
    routing::{get, post, put},
    Router,
};

use crate::entitlement::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/plans", get(api::list_plans))
        .route("/api/entitlement/:account_id", get(api::get_entitlement))
        .route("/api/entitlement/:account_id/consume", post(api::consume))
        .route(
            "/api/entitlement/:account_id/subscribe",
            post(api::subscribe),
        )
        .route("/api/entitlement/:account_id/cancel", post(api::cancel))
        .route("/api/billing/events", post(api::billing_events))
        .route("/api/admin/plans", post(api::admin_create_plan))
        .route(
            "/api/admin/plans/:id",
            put(api::admin_update_plan).delete(api::admin_retire_plan),
        )
        .route(
            "/api/admin/subscriptions",
            get(api::admin_list_subscriptions),
        )
        .route(
            "/api/admin/entitlement/:account_id/reset-usage",
            post(api::admin_reset_usage),
        )
        .route(
            "/api/admin/entitlement/:account_id/plan",
            post(api::admin_set_plan),
        )
}
