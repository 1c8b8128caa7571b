//! Admin token middleware

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::{error::ApiError, state::AppState};

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Require `Authorization: Bearer <ADMIN_API_TOKEN>`
pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(expected) = state.config.admin_api_token.as_deref() else {
        tracing::warn!(path = %path, "Admin route called but no admin token is configured");
        return ApiError::Unauthorized.into_response();
    };

    let authorized = extract_bearer_token(&request)
        .is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())));

    if !authorized {
        tracing::warn!(path = %path, "Admin token missing or invalid");
        return ApiError::Unauthorized.into_response();
    }

    next.run(request).await
}
