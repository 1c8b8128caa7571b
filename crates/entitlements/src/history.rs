//! Subscription audit trail
//!
//! Every lifecycle transition and administrative change appends a
//! [`HistoryEntry`]. Audit writes are best-effort: a failed write is logged and
//! never undoes the state change it describes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::EntitlementStore;
use crate::types::SubscriptionStatus;

/// Metadata key linking an entry to the payment that caused it
pub const PAYMENT_ID_KEY: &str = "payment_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    TrialStarted,
    Activated,
    Upgraded,
    Downgraded,
    Renewed,
    GracePeriod,
    Readonly,
    Expired,
    Cancelled,
    Suspended,
    MaintenancePaid,
    LicensePaid,
    PaymentRejected,
    AddonAdded,
    AddonDisabled,
    LimitOverride,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::TrialStarted => "trial_started",
            HistoryAction::Activated => "activated",
            HistoryAction::Upgraded => "upgraded",
            HistoryAction::Downgraded => "downgraded",
            HistoryAction::Renewed => "renewed",
            HistoryAction::GracePeriod => "grace_period",
            HistoryAction::Readonly => "readonly",
            HistoryAction::Expired => "expired",
            HistoryAction::Cancelled => "cancelled",
            HistoryAction::Suspended => "suspended",
            HistoryAction::MaintenancePaid => "maintenance_paid",
            HistoryAction::LicensePaid => "license_paid",
            HistoryAction::PaymentRejected => "payment_rejected",
            HistoryAction::AddonAdded => "addon_added",
            HistoryAction::AddonDisabled => "addon_disabled",
            HistoryAction::LimitOverride => "limit_override",
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub action: HistoryAction,
    pub from_plan_id: Option<Uuid>,
    pub to_plan_id: Option<Uuid>,
    pub from_status: Option<SubscriptionStatus>,
    pub to_status: Option<SubscriptionStatus>,
    pub performed_by: Option<Uuid>,
    pub notes: Option<String>,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl HistoryEntry {
    pub fn new(organization_id: Uuid, action: HistoryAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            subscription_id: None,
            action,
            from_plan_id: None,
            to_plan_id: None,
            from_status: None,
            to_status: None,
            performed_by: None,
            notes: None,
            metadata: serde_json::json!({}),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn plans(mut self, from: Option<Uuid>, to: Option<Uuid>) -> Self {
        self.from_plan_id = from;
        self.to_plan_id = to;
        self
    }

    pub fn statuses(
        mut self,
        from: Option<SubscriptionStatus>,
        to: Option<SubscriptionStatus>,
    ) -> Self {
        self.from_status = from;
        self.to_status = to;
        self
    }

    pub fn performed_by(mut self, actor: Option<Uuid>) -> Self {
        self.performed_by = actor;
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach the payment reference used for idempotent confirmation
    pub fn payment(mut self, payment_id: Option<&str>) -> Self {
        if let Some(payment_id) = payment_id {
            if let Some(map) = self.metadata.as_object_mut() {
                map.insert(PAYMENT_ID_KEY.to_string(), serde_json::Value::from(payment_id));
            } else {
                self.metadata = serde_json::json!({ PAYMENT_ID_KEY: payment_id });
            }
        }
        self
    }

    pub fn payment_id(&self) -> Option<&str> {
        self.metadata.get(PAYMENT_ID_KEY).and_then(|v| v.as_str())
    }
}

/// Appends audit entries, logging instead of failing
#[derive(Clone)]
pub struct HistoryRecorder {
    store: Arc<dyn EntitlementStore>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: HistoryEntry) {
        if let Err(e) = self.store.append_history(&entry).await {
            tracing::error!(
                org_id = %entry.organization_id,
                action = %entry.action,
                error = %e,
                "Failed to write subscription history entry"
            );
        }
    }
}
