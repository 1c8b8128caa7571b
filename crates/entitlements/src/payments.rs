//! Payment confirmation
//!
//! Payments are recorded outside this crate; once an operator or a payment
//! provider confirms one, [`PaymentService::confirm_payment`] applies it to the
//! subscription. Confirmation is idempotent per payment id: the store claims the
//! id in the same write that changes the subscription, so a replay or a racing
//! confirmation finds it taken.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EntitlementError, EntitlementResult};
use crate::history::{HistoryAction, HistoryEntry, HistoryRecorder};
use crate::lifecycle::{ActivationRequest, SubscriptionLifecycle};
use crate::models::OrganizationSubscription;
use crate::notifications::{notify_quietly, Notification, Notifier};
use crate::store::EntitlementStore;
use crate::types::Currency;

/// What a confirmed payment pays for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentKind {
    Activation {
        plan_id: Uuid,
        #[serde(default)]
        additional_schools: i32,
        #[serde(default)]
        license_paid: bool,
    },
    Maintenance,
    License,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub payment_id: String,
    pub organization_id: Uuid,
    pub kind: PaymentKind,
    pub amount_cents: i64,
    #[serde(default)]
    pub currency: Currency,
    #[serde(default)]
    pub performed_by: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRejection {
    pub payment_id: String,
    pub organization_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub performed_by: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Applied { subscription: Box<OrganizationSubscription> },
    /// The payment id was already applied; nothing changed
    AlreadyApplied,
}

pub struct PaymentService {
    lifecycle: Arc<SubscriptionLifecycle>,
    store: Arc<dyn EntitlementStore>,
    notifier: Arc<dyn Notifier>,
    history: HistoryRecorder,
}

impl PaymentService {
    pub fn new(
        lifecycle: Arc<SubscriptionLifecycle>,
        store: Arc<dyn EntitlementStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            lifecycle,
            history: HistoryRecorder::new(store.clone()),
            store,
            notifier,
        }
    }

    pub async fn confirm_payment(
        &self,
        payment: PaymentConfirmation,
    ) -> EntitlementResult<PaymentOutcome> {
        if payment.payment_id.trim().is_empty() {
            return Err(EntitlementError::InvalidInput(
                "Payment id is required".to_string(),
            ));
        }
        if payment.amount_cents < 0 {
            return Err(EntitlementError::InvalidInput(
                "Payment amount cannot be negative".to_string(),
            ));
        }

        if self.store.payment_applied(&payment.payment_id).await? {
            return Ok(already_applied(&payment));
        }

        let org = payment.organization_id;
        let applied = match &payment.kind {
            PaymentKind::Activation {
                plan_id,
                additional_schools,
                license_paid,
            } => {
                let mut request = ActivationRequest::new(org, *plan_id);
                request.currency = payment.currency;
                request.amount_paid_cents = payment.amount_cents;
                request.additional_schools = *additional_schools;
                request.license_paid = *license_paid;
                request.payment_id = Some(payment.payment_id.clone());
                request.performed_by = payment.performed_by;
                self.lifecycle.activate_subscription(request).await
            }
            PaymentKind::Maintenance => {
                self.lifecycle
                    .mark_maintenance_paid(
                        org,
                        OffsetDateTime::now_utc(),
                        Some(&payment.payment_id),
                        payment.performed_by,
                    )
                    .await
            }
            PaymentKind::License => {
                self.lifecycle
                    .mark_license_paid(org, Some(&payment.payment_id), payment.performed_by)
                    .await
            }
        };
        let subscription = match applied {
            Ok(subscription) => subscription,
            Err(EntitlementError::PaymentAlreadyApplied(_)) => return Ok(already_applied(&payment)),
            Err(e) => return Err(e),
        };

        notify_quietly(
            self.notifier.as_ref(),
            org,
            Notification::PaymentConfirmed {
                payment_id: payment.payment_id.clone(),
                amount_cents: payment.amount_cents,
                currency: payment.currency,
            },
        )
        .await;

        tracing::info!(
            org_id = %org,
            payment_id = %payment.payment_id,
            amount_cents = payment.amount_cents,
            currency = %payment.currency,
            "Payment confirmed"
        );
        Ok(PaymentOutcome::Applied {
            subscription: Box::new(subscription),
        })
    }

    /// Record a rejected payment. The subscription is left untouched.
    pub async fn reject_payment(&self, rejection: PaymentRejection) -> EntitlementResult<()> {
        let subscription_id = self
            .store
            .current_subscription(rejection.organization_id)
            .await?
            .map(|s| s.id);

        let mut entry = HistoryEntry::new(rejection.organization_id, HistoryAction::PaymentRejected)
            .performed_by(rejection.performed_by)
            .notes(
                rejection
                    .reason
                    .clone()
                    .unwrap_or_else(|| "Payment rejected".to_string()),
            )
            .metadata(serde_json::json!({ "rejected_payment_id": rejection.payment_id }));
        if let Some(id) = subscription_id {
            entry = entry.subscription(id);
        }
        self.history.record(entry).await;

        notify_quietly(
            self.notifier.as_ref(),
            rejection.organization_id,
            Notification::PaymentRejected {
                payment_id: rejection.payment_id.clone(),
                reason: rejection.reason,
            },
        )
        .await;

        tracing::info!(
            org_id = %rejection.organization_id,
            payment_id = %rejection.payment_id,
            "Payment rejected"
        );
        Ok(())
    }
}

fn already_applied(payment: &PaymentConfirmation) -> PaymentOutcome {
    tracing::info!(
        org_id = %payment.organization_id,
        payment_id = %payment.payment_id,
        "Payment already applied, skipping"
    );
    PaymentOutcome::AlreadyApplied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriptionStatus;
    use crate::test_support::test_engine;

    fn confirmation(org: Uuid, payment_id: &str, kind: PaymentKind) -> PaymentConfirmation {
        PaymentConfirmation {
            payment_id: payment_id.to_string(),
            organization_id: org,
            kind,
            amount_cents: 1_500_000,
            currency: Currency::Afn,
            performed_by: None,
        }
    }

    #[tokio::test]
    async fn test_activation_payment_is_idempotent() {
        let t = test_engine();
        let org = t.org_on("trial", SubscriptionStatus::Trial).await;
        let kind = PaymentKind::Activation {
            plan_id: t.plan("starter").id,
            additional_schools: 0,
            license_paid: true,
        };

        let first = t
            .engine
            .payments()
            .confirm_payment(confirmation(org, "pay_1", kind.clone()))
            .await
            .unwrap();
        let PaymentOutcome::Applied { subscription } = first else {
            panic!("expected the payment to apply");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.license_payment_id.as_deref(), Some("pay_1"));

        let second = t
            .engine
            .payments()
            .confirm_payment(confirmation(org, "pay_1", kind))
            .await
            .unwrap();
        assert_eq!(second, PaymentOutcome::AlreadyApplied);
        assert_eq!(t.store.subscription_rows(org).await.len(), 2);
        assert_eq!(
            t.notifier
                .kinds()
                .iter()
                .filter(|k| **k == "payment_confirmed")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_maintenance_payment_restores_grace_row() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::GracePeriod).await;

        let outcome = t
            .engine
            .payments()
            .confirm_payment(confirmation(org, "pay_m", PaymentKind::Maintenance))
            .await
            .unwrap();
        let PaymentOutcome::Applied { subscription } = outcome else {
            panic!("expected the payment to apply");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert!(t.store.payment_applied("pay_m").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejection_leaves_subscription_alone() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::GracePeriod).await;

        t.engine
            .payments()
            .reject_payment(PaymentRejection {
                payment_id: "pay_bad".to_string(),
                organization_id: org,
                reason: Some("Receipt unreadable".to_string()),
                performed_by: None,
            })
            .await
            .unwrap();

        let current = t.store.current_subscription(org).await.unwrap().unwrap();
        assert_eq!(current.status, SubscriptionStatus::GracePeriod);
        assert_eq!(t.notifier.kinds(), vec!["payment_rejected"]);
        assert!(!t.store.payment_applied("pay_bad").await.unwrap());
    }

    #[tokio::test]
    async fn test_replay_is_detected_without_history() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::Active).await;
        t.store.set_history_failing(true);

        let first = t
            .engine
            .payments()
            .confirm_payment(confirmation(org, "pay_m2", PaymentKind::Maintenance))
            .await
            .unwrap();
        let PaymentOutcome::Applied { subscription } = first else {
            panic!("expected the payment to apply");
        };
        assert!(t.store.history(org).await.unwrap().is_empty());

        let replay = t
            .engine
            .payments()
            .confirm_payment(confirmation(org, "pay_m2", PaymentKind::Maintenance))
            .await
            .unwrap();
        assert_eq!(replay, PaymentOutcome::AlreadyApplied);

        let current = t.store.current_subscription(org).await.unwrap().unwrap();
        assert_eq!(current.next_maintenance_due_at, subscription.next_maintenance_due_at);
    }

    #[tokio::test]
    async fn test_claimed_payment_id_stops_a_racing_write() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::Active).await;
        let before = t.store.current_subscription(org).await.unwrap().unwrap();

        t.engine
            .lifecycle()
            .mark_license_paid(org, Some("pay_race"), None)
            .await
            .unwrap();
        let err = t
            .engine
            .lifecycle()
            .mark_maintenance_paid(org, OffsetDateTime::now_utc(), Some("pay_race"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::PaymentAlreadyApplied(_)));

        let current = t.store.current_subscription(org).await.unwrap().unwrap();
        assert_eq!(current.next_maintenance_due_at, before.next_maintenance_due_at);
    }

    #[tokio::test]
    async fn test_blank_payment_id_rejected() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::Active).await;
        let err = t
            .engine
            .payments()
            .confirm_payment(confirmation(org, "  ", PaymentKind::License))
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidInput(_)));
    }
}
