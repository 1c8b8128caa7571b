//! Read-side entitlement routes
//!
//! These back the enforcement checks of the school application. None of them
//! fails on an infrastructure error except the status and usage reports.

use axum::{
    extract::{Path, State},
    Json,
};
use edugate_entitlements::{
    AccessLevel, FeatureAccess, FeatureStatus, OrganizationSubscription, StatusSummary,
    UsageCheck, UsageSnapshot,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessResponse {
    pub access_level: AccessLevel,
    pub can_read: bool,
    pub can_write: bool,
}

pub async fn list_features(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<Vec<FeatureStatus>>> {
    Ok(Json(state.engine.all_features_status(org_id).await?))
}

pub async fn feature_access(
    State(state): State<AppState>,
    Path((org_id, feature_key)): Path<(Uuid, String)>,
) -> Json<FeatureAccess> {
    Json(
        state
            .engine
            .features()
            .feature_access_status(org_id, &feature_key)
            .await,
    )
}

pub async fn access(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> Json<AccessResponse> {
    let access_level = state.engine.access_level(org_id).await;
    Json(AccessResponse {
        access_level,
        can_read: access_level.can_read(),
        can_write: access_level.can_write(),
    })
}

pub async fn subscription_status(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<StatusSummary>> {
    Ok(Json(state.engine.subscription_status(org_id).await?))
}

pub async fn usage(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<UsageSnapshot>> {
    Ok(Json(state.engine.usage().snapshot(org_id).await?))
}

pub async fn can_create(
    State(state): State<AppState>,
    Path((org_id, resource_key)): Path<(Uuid, String)>,
) -> ApiResult<Json<UsageCheck>> {
    if state.engine.catalog().resource(&resource_key).is_none() {
        return Err(ApiError::NotFound(format!("Unknown resource: {}", resource_key)));
    }
    Ok(Json(state.engine.can_create(org_id, &resource_key).await))
}

/// Start the trial for a newly created organization
pub async fn create_trial(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<OrganizationSubscription>> {
    let subscription = state
        .engine
        .lifecycle()
        .create_trial_subscription(org_id, None)
        .await?;
    Ok(Json(subscription))
}
