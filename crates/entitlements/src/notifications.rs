//! Subscription notifications
//!
//! The engine decides *when* an organization should hear about its subscription;
//! delivery is delegated to a [`Notifier`]. Templates and email transport live
//! outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{EntitlementError, EntitlementResult};
use crate::types::Currency;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    TrialWelcome {
        plan_name: String,
        trial_days: i32,
    },
    TrialEnding {
        days_left: i64,
    },
    RenewalReminder {
        days_left: i64,
    },
    GracePeriodStarted {
        grace_period_days: i32,
    },
    GracePeriodEnding {
        days_left: i64,
    },
    ReadonlyStarted {
        readonly_period_days: i32,
    },
    Expired,
    Suspended {
        reason: Option<String>,
    },
    PaymentConfirmed {
        payment_id: String,
        amount_cents: i64,
        currency: Currency,
    },
    PaymentRejected {
        payment_id: String,
        reason: Option<String>,
    },
    SubscriptionActivated {
        plan_name: String,
        #[serde(with = "time::serde::rfc3339::option")]
        expires_at: Option<OffsetDateTime>,
    },
    LimitWarning {
        resource: String,
        current: f64,
        limit: u64,
        percentage: f64,
    },
    LimitReached {
        resource: String,
        limit: u64,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::TrialWelcome { .. } => "trial_welcome",
            Notification::TrialEnding { .. } => "trial_ending",
            Notification::RenewalReminder { .. } => "renewal_reminder",
            Notification::GracePeriodStarted { .. } => "grace_period_started",
            Notification::GracePeriodEnding { .. } => "grace_period_ending",
            Notification::ReadonlyStarted { .. } => "readonly_started",
            Notification::Expired => "expired",
            Notification::Suspended { .. } => "suspended",
            Notification::PaymentConfirmed { .. } => "payment_confirmed",
            Notification::PaymentRejected { .. } => "payment_rejected",
            Notification::SubscriptionActivated { .. } => "subscription_activated",
            Notification::LimitWarning { .. } => "limit_warning",
            Notification::LimitReached { .. } => "limit_reached",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        organization_id: Uuid,
        notification: &Notification,
    ) -> EntitlementResult<()>;
}

/// Deliver a notification, logging failures instead of returning them
pub async fn notify_quietly(
    notifier: &dyn Notifier,
    organization_id: Uuid,
    notification: Notification,
) {
    if let Err(e) = notifier.notify(organization_id, &notification).await {
        tracing::warn!(
            org_id = %organization_id,
            notification = notification.kind(),
            error = %e,
            "Failed to deliver subscription notification"
        );
    }
}

/// Writes notifications to the log; used when no webhook is configured
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        organization_id: Uuid,
        notification: &Notification,
    ) -> EntitlementResult<()> {
        tracing::info!(
            org_id = %organization_id,
            notification = notification.kind(),
            payload = %serde_json::to_string(notification)?,
            "Subscription notification"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    organization_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    sent_at: OffsetDateTime,
    notification: &'a Notification,
}

/// Posts notifications as JSON to an external delivery service
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    max_retries: usize,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> EntitlementResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            max_retries: 3,
        })
    }

    async fn post_once(&self, body: &WebhookPayload<'_>) -> EntitlementResult<()> {
        let response = self.client.post(&self.url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EntitlementError::Notification(format!(
                "webhook responded with {}",
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        organization_id: Uuid,
        notification: &Notification,
    ) -> EntitlementResult<()> {
        let body = WebhookPayload {
            organization_id,
            sent_at: OffsetDateTime::now_utc(),
            notification,
        };

        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.max_retries);

        Retry::spawn(strategy, || self.post_once(&body)).await?;

        tracing::debug!(
            org_id = %organization_id,
            notification = notification.kind(),
            "Notification delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_serializes_with_type_tag() {
        let json = serde_json::to_value(Notification::GracePeriodStarted {
            grace_period_days: 14,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "grace_period_started", "grace_period_days": 14})
        );
    }

    #[tokio::test]
    async fn test_log_notifier_accepts_every_kind() {
        let notifier = LogNotifier;
        let org = Uuid::new_v4();
        for notification in [
            Notification::Expired,
            Notification::LimitReached {
                resource: "students".to_string(),
                limit: 5,
            },
            Notification::Suspended { reason: None },
        ] {
            notifier.notify(org, &notification).await.unwrap();
        }
    }
}
