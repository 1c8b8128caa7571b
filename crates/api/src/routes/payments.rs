//! Payment confirmation routes

use axum::{extract::State, http::StatusCode, Json};
use edugate_entitlements::{PaymentConfirmation, PaymentOutcome, PaymentRejection};

use crate::{error::ApiResult, state::AppState};

pub async fn confirm_payment(
    State(state): State<AppState>,
    Json(payment): Json<PaymentConfirmation>,
) -> ApiResult<Json<PaymentOutcome>> {
    tracing::info!(
        org_id = %payment.organization_id,
        payment_id = %payment.payment_id,
        "Confirming payment"
    );
    Ok(Json(state.engine.payments().confirm_payment(payment).await?))
}

pub async fn reject_payment(
    State(state): State<AppState>,
    Json(rejection): Json<PaymentRejection>,
) -> ApiResult<StatusCode> {
    state.engine.payments().reject_payment(rejection).await?;
    Ok(StatusCode::NO_CONTENT)
}
