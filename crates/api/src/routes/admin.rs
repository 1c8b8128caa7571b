//! Operator routes

use axum::{extract::State, Json};
use edugate_entitlements::{InvariantCheckSummary, TransitionSummary};
use time::OffsetDateTime;

use crate::{error::ApiResult, state::AppState};

/// Run the lifecycle sweep once
pub async fn run_sweep(State(state): State<AppState>) -> ApiResult<Json<TransitionSummary>> {
    let summary = state
        .engine
        .lifecycle()
        .process_status_transitions(OffsetDateTime::now_utc())
        .await?;
    tracing::info!(
        to_grace_period = summary.to_grace_period,
        to_readonly = summary.to_readonly,
        to_expired = summary.to_expired,
        "Manual sweep complete"
    );
    Ok(Json(summary))
}

pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    Ok(Json(state.engine.invariants().run_all_checks().await?))
}
