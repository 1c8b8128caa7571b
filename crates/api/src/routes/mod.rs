//! HTTP routes

pub mod admin;
pub mod entitlements;
pub mod payments;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_admin_token, state::AppState};

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn create_router(state: AppState) -> Router {
    // Enforcement reads used by the school application
    let public = Router::new()
        .route("/health", get(health))
        .route("/v1/orgs/{org_id}/features", get(entitlements::list_features))
        .route(
            "/v1/orgs/{org_id}/features/{feature_key}",
            get(entitlements::feature_access),
        )
        .route("/v1/orgs/{org_id}/access", get(entitlements::access))
        .route(
            "/v1/orgs/{org_id}/subscription",
            get(entitlements::subscription_status),
        )
        .route("/v1/orgs/{org_id}/usage", get(entitlements::usage))
        .route(
            "/v1/orgs/{org_id}/usage/{resource_key}/can-create",
            get(entitlements::can_create),
        );

    // Mutations and operator tooling
    let admin = Router::new()
        .route("/v1/orgs/{org_id}/trial", post(entitlements::create_trial))
        .route("/v1/payments/confirm", post(payments::confirm_payment))
        .route("/v1/payments/reject", post(payments::reject_payment))
        .route("/v1/admin/sweep", post(admin::run_sweep))
        .route("/v1/admin/invariants", get(admin::run_invariants))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    public.merge(admin).with_state(state)
}
