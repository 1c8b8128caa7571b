//! API error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use edugate_entitlements::EntitlementError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    /// Feature or limit denial; the message is shown to users verbatim
    #[error("{0}")]
    Forbidden(String),

    #[error("Internal server error")]
    Internal,
}

impl From<EntitlementError> for ApiError {
    fn from(err: EntitlementError) -> Self {
        match err {
            EntitlementError::NotFound(msg) => ApiError::NotFound(msg),
            EntitlementError::InvalidInput(msg) => ApiError::Validation(msg),
            e @ EntitlementError::FeatureUnavailable { .. } => ApiError::Forbidden(e.to_string()),
            EntitlementError::LimitReached { message, .. } => ApiError::Forbidden(message),
            EntitlementError::ConcurrentModification(msg) => ApiError::Conflict(msg),
            e @ EntitlementError::PaymentAlreadyApplied(_) => ApiError::Conflict(e.to_string()),
            e => {
                tracing::error!(error = %e, "Entitlement operation failed");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
