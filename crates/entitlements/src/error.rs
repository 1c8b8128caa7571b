//! Entitlement error types

use thiserror::Error;

/// Errors raised by the entitlement engine.
///
/// Hot read paths (`can_create`, `limit`, `enabled_features`) never surface these to
/// callers; they log and fall back to documented defaults. Write paths (activation,
/// cancellation, payment confirmation) propagate them.
#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Raised by `assert_feature`; the message is shown to end users verbatim.
    #[error("{name} is not available on your current plan. Please upgrade to access this feature.")]
    FeatureUnavailable { feature: String, name: String },

    /// Raised by `assert_can_create`; carries the same message `can_create` returns.
    #[error("{message}")]
    LimitReached { resource: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage backend error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Notification delivery failed: {0}")]
    Notification(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// The payment id was claimed by an earlier write
    #[error("Payment {0} was already applied")]
    PaymentAlreadyApplied(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EntitlementError {
    /// Whether the message is safe to show to an end user as-is.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            EntitlementError::NotFound(_)
                | EntitlementError::InvalidInput(_)
                | EntitlementError::FeatureUnavailable { .. }
                | EntitlementError::LimitReached { .. }
        )
    }
}

impl From<sqlx::Error> for EntitlementError {
    fn from(err: sqlx::Error) -> Self {
        EntitlementError::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for EntitlementError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EntitlementError::Database(format!("migration failed: {}", err))
    }
}

impl From<redis::RedisError> for EntitlementError {
    fn from(err: redis::RedisError) -> Self {
        EntitlementError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for EntitlementError {
    fn from(err: serde_json::Error) -> Self {
        EntitlementError::Internal(format!("serialization failed: {}", err))
    }
}

impl From<std::io::Error> for EntitlementError {
    fn from(err: std::io::Error) -> Self {
        EntitlementError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for EntitlementError {
    fn from(err: reqwest::Error) -> Self {
        EntitlementError::Notification(err.to_string())
    }
}

impl From<time::error::ComponentRange> for EntitlementError {
    fn from(err: time::error::ComponentRange) -> Self {
        EntitlementError::Internal(format!("date out of range: {}", err))
    }
}

pub type EntitlementResult<T> = Result<T, EntitlementError>;
