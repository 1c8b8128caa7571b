//! Subscription lifecycle
//!
//! Owns every write to `organization_subscriptions`:
//! - trial creation and paid activation (append a new current row, supersede the old one)
//! - the time-driven sweep `trial/active/pending_renewal -> grace_period -> readonly -> expired`
//! - manual cancel and suspend
//! - maintenance and license payments
//! - addon and limit override administration
//!
//! Status transitions are compare-and-swap updates on the expected source
//! status, so overlapping sweeps never double-apply a transition. Access level
//! evaluation is a pure function of the row, its plan and `now`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::cache::FeatureCache;
use crate::catalog::{PlanCatalog, PlanRef};
use crate::config::EngineConfig;
use crate::error::{EntitlementError, EntitlementResult};
use crate::history::{HistoryAction, HistoryEntry, HistoryRecorder};
use crate::models::{
    FeatureAddon, LimitOverride, OrganizationSubscription, SubscriptionPlan, LOCKED_FEATURES_KEY,
};
use crate::notifications::{notify_quietly, Notification, Notifier};
use crate::store::EntitlementStore;
use crate::types::{AccessLevel, BillingPeriod, Currency, Limit, SubscriptionStatus};

const DEFAULT_GRACE_PERIOD_DAYS: i32 = 14;
const DEFAULT_READONLY_PERIOD_DAYS: i32 = 60;

const LOCKED_AT_KEY: &str = "locked_at";
const LOCKED_REASON_KEY: &str = "locked_reason";
const LOCKED_REASON_DOWNGRADE: &str = "plan_downgrade";

/// Payment grace windows and the trial plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Days past `next_maintenance_due_at` before access is blocked
    pub maintenance_grace_days: i64,
    /// Days past `started_at` an unpaid license fee is tolerated
    pub license_grace_days: i64,
    pub trial_plan_slug: String,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for LifecyclePolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            maintenance_grace_days: config.maintenance_grace_days,
            license_grace_days: config.license_grace_days,
            trial_plan_slug: config.trial_plan_slug.clone(),
        }
    }
}

// ============================================================================
// Time windows and payment state
// ============================================================================

fn grace_days(plan: Option<&SubscriptionPlan>) -> i32 {
    plan.map_or(DEFAULT_GRACE_PERIOD_DAYS, |p| p.grace_period_days)
}

fn readonly_days(plan: Option<&SubscriptionPlan>) -> i32 {
    plan.map_or(DEFAULT_READONLY_PERIOD_DAYS, |p| p.readonly_period_days)
}

/// Stored grace end, or the one implied by `expires_at`
pub fn grace_period_end(
    sub: &OrganizationSubscription,
    plan: Option<&SubscriptionPlan>,
) -> Option<OffsetDateTime> {
    sub.grace_period_ends_at.or_else(|| {
        sub.expires_at
            .map(|expires| expires + Duration::days(i64::from(grace_days(plan))))
    })
}

/// Stored readonly end, or the one implied by the grace window
pub fn readonly_period_end(
    sub: &OrganizationSubscription,
    plan: Option<&SubscriptionPlan>,
) -> Option<OffsetDateTime> {
    sub.readonly_period_ends_at.or_else(|| {
        grace_period_end(sub, plan).map(|end| end + Duration::days(i64::from(readonly_days(plan))))
    })
}

pub fn is_in_grace_period(
    sub: &OrganizationSubscription,
    plan: Option<&SubscriptionPlan>,
    now: OffsetDateTime,
) -> bool {
    let grace_end = grace_period_end(sub, plan);
    match sub.status {
        SubscriptionStatus::GracePeriod => grace_end.map_or(true, |end| now <= end),
        status if status.is_running() => {
            sub.expires_at.is_some_and(|expires| expires < now)
                && grace_end.is_some_and(|end| now <= end)
        }
        _ => false,
    }
}

pub fn is_in_readonly_period(
    sub: &OrganizationSubscription,
    plan: Option<&SubscriptionPlan>,
    now: OffsetDateTime,
) -> bool {
    match sub.status {
        SubscriptionStatus::Readonly => true,
        status if status.is_running() || status == SubscriptionStatus::GracePeriod => {
            grace_period_end(sub, plan).is_some_and(|end| end < now)
                && readonly_period_end(sub, plan).is_some_and(|end| now <= end)
        }
        _ => false,
    }
}

/// Trial or active and not past `expires_at`
pub fn can_write_by_status(sub: &OrganizationSubscription, now: OffsetDateTime) -> bool {
    matches!(
        sub.status,
        SubscriptionStatus::Trial | SubscriptionStatus::Active
    ) && sub.expires_at.map_or(true, |expires| expires > now)
}

pub fn is_maintenance_overdue(sub: &OrganizationSubscription, now: OffsetDateTime) -> bool {
    sub.next_maintenance_due_at.is_some_and(|due| due < now)
}

pub fn days_maintenance_overdue(sub: &OrganizationSubscription, now: OffsetDateTime) -> i64 {
    match sub.next_maintenance_due_at {
        Some(due) if due < now => (now - due).whole_days(),
        _ => 0,
    }
}

pub fn days_until_maintenance_due(
    sub: &OrganizationSubscription,
    now: OffsetDateTime,
) -> Option<i64> {
    sub.next_maintenance_due_at
        .map(|due| (due - now).whole_days().max(0))
}

/// Paid plan whose one-time license fee has not been settled
pub fn is_license_pending(sub: &OrganizationSubscription, plan: Option<&SubscriptionPlan>) -> bool {
    sub.status != SubscriptionStatus::Trial
        && sub.license_paid_at.is_none()
        && plan.is_some_and(SubscriptionPlan::requires_license_fee)
}

/// Reasons access is blocked for non-payment; empty when nothing is owed past grace
pub fn payment_suspension_reasons(
    sub: &OrganizationSubscription,
    plan: Option<&SubscriptionPlan>,
    policy: &LifecyclePolicy,
    now: OffsetDateTime,
) -> Vec<String> {
    let maintenance_blocked = sub
        .next_maintenance_due_at
        .is_some_and(|due| due + Duration::days(policy.maintenance_grace_days) < now);
    let license_blocked = is_license_pending(sub, plan)
        && sub
            .started_at
            .is_some_and(|started| started + Duration::days(policy.license_grace_days) < now);

    let mut reasons = Vec::new();
    if maintenance_blocked || license_blocked {
        if is_maintenance_overdue(sub, now) {
            reasons.push(format!(
                "Maintenance fee overdue ({} day(s))",
                days_maintenance_overdue(sub, now)
            ));
        }
        if is_license_pending(sub, plan) {
            reasons.push("License fee not paid".to_string());
        }
    }
    reasons
}

/// Access level for a subscription row, first matching rule wins
pub fn access_level_for(
    sub: Option<&OrganizationSubscription>,
    plan: Option<&SubscriptionPlan>,
    policy: &LifecyclePolicy,
    now: OffsetDateTime,
) -> AccessLevel {
    let Some(sub) = sub else {
        return AccessLevel::None;
    };

    if !payment_suspension_reasons(sub, plan, policy, now).is_empty() {
        return AccessLevel::Blocked;
    }
    if matches!(
        sub.status,
        SubscriptionStatus::Suspended | SubscriptionStatus::Cancelled
    ) {
        return AccessLevel::Blocked;
    }
    if is_in_readonly_period(sub, plan, now) {
        return AccessLevel::Readonly;
    }
    if is_in_grace_period(sub, plan, now) {
        return AccessLevel::Grace;
    }
    if can_write_by_status(sub, now) {
        return AccessLevel::Full;
    }
    AccessLevel::Readonly
}

/// User-facing message for the current status; payment issues take precedence
pub fn status_message(
    sub: &OrganizationSubscription,
    plan: Option<&SubscriptionPlan>,
    policy: &LifecyclePolicy,
    now: OffsetDateTime,
) -> String {
    let reasons = payment_suspension_reasons(sub, plan, policy, now);
    if !reasons.is_empty() {
        return format!(
            "Account suspended: {}. Please make payment to restore access.",
            reasons.join(", ")
        );
    }

    match sub.status {
        SubscriptionStatus::Trial => format!(
            "Trial period - {} days left",
            sub.trial_days_left(now).unwrap_or(0)
        ),
        SubscriptionStatus::Active => "Active subscription".to_string(),
        SubscriptionStatus::PendingRenewal | SubscriptionStatus::Expired => {
            "Subscription expired - please renew".to_string()
        }
        SubscriptionStatus::GracePeriod => "Grace period - please renew to continue".to_string(),
        SubscriptionStatus::Readonly => {
            "Read-only mode - please renew to regain full access".to_string()
        }
        SubscriptionStatus::Suspended => format!(
            "Account suspended: {}",
            sub.suspension_reason.as_deref().unwrap_or("Contact support")
        ),
        SubscriptionStatus::Cancelled => "Subscription cancelled".to_string(),
    }
}

// ============================================================================
// Requests and summaries
// ============================================================================

/// Activation of a paid plan, normally after a confirmed payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    /// Plan default when omitted
    #[serde(default)]
    pub billing_period: Option<BillingPeriod>,
    #[serde(default)]
    pub currency: Currency,
    #[serde(default)]
    pub amount_paid_cents: i64,
    #[serde(default)]
    pub additional_schools: i32,
    #[serde(default)]
    pub license_paid: bool,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub performed_by: Option<Uuid>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ActivationRequest {
    pub fn new(organization_id: Uuid, plan_id: Uuid) -> Self {
        Self {
            organization_id,
            plan_id,
            billing_period: None,
            currency: Currency::default(),
            amount_paid_cents: 0,
            additional_schools: 0,
            license_paid: false,
            payment_id: None,
            performed_by: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOverrideRequest {
    pub resource_key: String,
    pub limit: Limit,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub granted_by: Option<Uuid>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

/// Transitions applied by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSummary {
    pub to_grace_period: usize,
    pub to_readonly: usize,
    pub to_expired: usize,
}

impl TransitionSummary {
    pub fn total(&self) -> usize {
        self.to_grace_period + self.to_readonly + self.to_expired
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderSummary {
    pub trial_ending: usize,
    pub renewal_reminders: usize,
    pub grace_ending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    /// `None` when the organization has no subscription
    pub status: Option<SubscriptionStatus>,
    pub access_level: AccessLevel,
    pub message: String,
    pub can_read: bool,
    pub can_write: bool,
    pub plan: Option<PlanRef>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub grace_period_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub readonly_period_ends_at: Option<OffsetDateTime>,
    pub days_left: Option<i64>,
    pub trial_days_left: Option<i64>,
    pub is_trial: bool,
    pub additional_schools: i32,
    pub total_schools_allowed: Option<i64>,
    pub maintenance_overdue: bool,
    pub maintenance_days_overdue: i64,
    pub maintenance_days_until_due: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_maintenance_due_at: Option<OffsetDateTime>,
    pub license_fee_pending: bool,
    pub license_fee_required: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub license_paid_at: Option<OffsetDateTime>,
}

impl StatusSummary {
    fn none() -> Self {
        Self {
            status: None,
            access_level: AccessLevel::None,
            message: "No active subscription".to_string(),
            can_read: false,
            can_write: false,
            plan: None,
            started_at: None,
            expires_at: None,
            trial_ends_at: None,
            grace_period_ends_at: None,
            readonly_period_ends_at: None,
            days_left: None,
            trial_days_left: None,
            is_trial: false,
            additional_schools: 0,
            total_schools_allowed: None,
            maintenance_overdue: false,
            maintenance_days_overdue: 0,
            maintenance_days_until_due: None,
            next_maintenance_due_at: None,
            license_fee_pending: false,
            license_fee_required: false,
            license_paid_at: None,
        }
    }
}

fn classify_activation(
    current: Option<&OrganizationSubscription>,
    from_plan: Option<&SubscriptionPlan>,
    to_plan: &SubscriptionPlan,
    currency: Currency,
    additional_schools: i32,
) -> HistoryAction {
    let Some(current) = current else {
        return HistoryAction::Activated;
    };

    if current.plan_id == to_plan.id {
        return if current.status.is_renewable() {
            HistoryAction::Renewed
        } else {
            HistoryAction::Activated
        };
    }

    match from_plan {
        Some(from) => {
            let from_cost = from.total_initial_cost(currency, additional_schools);
            let to_cost = to_plan.total_initial_cost(currency, additional_schools);
            match to_cost.cmp(&from_cost) {
                std::cmp::Ordering::Greater => HistoryAction::Upgraded,
                std::cmp::Ordering::Less => HistoryAction::Downgraded,
                std::cmp::Ordering::Equal => HistoryAction::Activated,
            }
        }
        None => HistoryAction::Activated,
    }
}

// ============================================================================
// Lifecycle service
// ============================================================================

#[derive(Clone)]
pub struct SubscriptionLifecycle {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<PlanCatalog>,
    feature_cache: Arc<dyn FeatureCache>,
    notifier: Arc<dyn Notifier>,
    history: HistoryRecorder,
    policy: LifecyclePolicy,
}

impl SubscriptionLifecycle {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        catalog: Arc<PlanCatalog>,
        feature_cache: Arc<dyn FeatureCache>,
        notifier: Arc<dyn Notifier>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            history: HistoryRecorder::new(store.clone()),
            store,
            catalog,
            feature_cache,
            notifier,
            policy,
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub async fn current_subscription(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<Option<OrganizationSubscription>> {
        self.store.current_subscription(organization_id).await
    }

    pub async fn current_plan(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<Option<SubscriptionPlan>> {
        let subscription = self.store.current_subscription(organization_id).await?;
        Ok(subscription.and_then(|sub| self.catalog.plan(sub.plan_id).cloned()))
    }

    async fn require_current(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<OrganizationSubscription> {
        self.store
            .current_subscription(organization_id)
            .await?
            .ok_or_else(|| EntitlementError::NotFound("No active subscription found".to_string()))
    }

    async fn invalidate_features(&self, organization_id: Uuid) {
        if let Err(e) = self.feature_cache.invalidate(organization_id).await {
            tracing::warn!(
                org_id = %organization_id,
                error = %e,
                "Failed to invalidate feature cache"
            );
        }
    }

    /// Persist an in-place change, failing if the row moved under us
    async fn save_if_status(
        &self,
        updated: &OrganizationSubscription,
        expected: SubscriptionStatus,
        payment_id: Option<&str>,
    ) -> EntitlementResult<()> {
        if self
            .store
            .update_subscription_if_status(updated, expected, payment_id)
            .await?
        {
            Ok(())
        } else {
            Err(EntitlementError::ConcurrentModification(format!(
                "subscription {} changed concurrently",
                updated.id
            )))
        }
    }

    // ------------------------------------------------------------------------
    // Trial and activation
    // ------------------------------------------------------------------------

    pub async fn create_trial_subscription(
        &self,
        organization_id: Uuid,
        performed_by: Option<Uuid>,
    ) -> EntitlementResult<OrganizationSubscription> {
        let plan = self
            .catalog
            .plan_by_slug(&self.policy.trial_plan_slug)
            .filter(|plan| plan.is_active)
            .ok_or_else(|| EntitlementError::Config("Trial plan not found".to_string()))?;

        if self.store.current_subscription(organization_id).await?.is_some() {
            return Err(EntitlementError::InvalidInput(
                "Organization already has a subscription".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let subscription = OrganizationSubscription::new_trial(organization_id, plan, now);
        self.store.replace_subscription(None, &subscription, None).await?;

        let trial_days = subscription
            .trial_ends_at
            .map_or(0, |end| (end - now).whole_days());

        self.history
            .record(
                HistoryEntry::new(organization_id, HistoryAction::TrialStarted)
                    .subscription(subscription.id)
                    .plans(None, Some(plan.id))
                    .statuses(None, Some(SubscriptionStatus::Trial))
                    .performed_by(performed_by)
                    .notes(format!("Trial started for {} days", trial_days)),
            )
            .await;
        self.invalidate_features(organization_id).await;

        tracing::info!(
            org_id = %organization_id,
            plan = %plan.slug,
            trial_days = trial_days,
            "Trial subscription created"
        );

        notify_quietly(
            self.notifier.as_ref(),
            organization_id,
            Notification::TrialWelcome {
                plan_name: plan.name.clone(),
                trial_days: i32::try_from(trial_days).unwrap_or(i32::MAX),
            },
        )
        .await;

        Ok(subscription)
    }

    /// Features lost by moving from `from` to `to`, minus those kept by addons
    async fn features_locked_by_downgrade(
        &self,
        organization_id: Uuid,
        from: &SubscriptionPlan,
        to: &SubscriptionPlan,
        now: OffsetDateTime,
    ) -> EntitlementResult<Vec<String>> {
        let target = self.catalog.inherited_feature_keys(to.id);
        let aliases = self.catalog.aliases();
        let addon_keys: HashSet<String> = self
            .store
            .feature_addons(organization_id)
            .await?
            .into_iter()
            .filter(|addon| addon.grants(now))
            .map(|addon| aliases.canonical(&addon.feature_key).to_string())
            .collect();

        let mut removed: Vec<String> = self
            .catalog
            .inherited_feature_keys(from.id)
            .into_iter()
            .filter(|key| !target.contains(key) && !addon_keys.contains(key))
            .collect();
        removed.sort();
        Ok(removed)
    }

    pub async fn activate_subscription(
        &self,
        request: ActivationRequest,
    ) -> EntitlementResult<OrganizationSubscription> {
        let organization_id = request.organization_id;
        let plan = self
            .catalog
            .plan(request.plan_id)
            .ok_or_else(|| {
                EntitlementError::NotFound(format!("Plan {} not found", request.plan_id))
            })?;

        if !plan.is_active {
            return Err(EntitlementError::InvalidInput(format!(
                "Plan '{}' is not available",
                plan.slug
            )));
        }
        if request.additional_schools < 0 {
            return Err(EntitlementError::InvalidInput(
                "additional_schools cannot be negative".to_string(),
            ));
        }

        let current = self.store.current_subscription(organization_id).await?;
        if current
            .as_ref()
            .is_some_and(|sub| sub.status == SubscriptionStatus::Cancelled)
        {
            return Err(EntitlementError::InvalidInput(
                "Cancelled subscriptions cannot be reactivated".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let from_plan = current.as_ref().and_then(|sub| self.catalog.plan(sub.plan_id));
        let action = classify_activation(
            current.as_ref(),
            from_plan,
            plan,
            request.currency,
            request.additional_schools,
        );

        let mut metadata = current
            .as_ref()
            .and_then(|sub| sub.metadata.as_object().cloned())
            .unwrap_or_default();
        let plan_changed = current.as_ref().is_some_and(|sub| sub.plan_id != plan.id);

        if action == HistoryAction::Downgraded {
            if let Some(from) = from_plan {
                let locked = self
                    .features_locked_by_downgrade(organization_id, from, plan, now)
                    .await?;
                metadata.insert(LOCKED_FEATURES_KEY.to_string(), serde_json::json!(locked));
                metadata.insert(
                    LOCKED_AT_KEY.to_string(),
                    time::serde::rfc3339::serialize(&now, serde_json::value::Serializer)?,
                );
                metadata.insert(
                    LOCKED_REASON_KEY.to_string(),
                    serde_json::Value::from(LOCKED_REASON_DOWNGRADE),
                );
            }
        } else if plan_changed {
            metadata.remove(LOCKED_FEATURES_KEY);
            metadata.remove(LOCKED_AT_KEY);
            metadata.remove(LOCKED_REASON_KEY);
        }

        let billing_period = request.billing_period.unwrap_or(plan.billing_period);
        let expires_at = now + Duration::days(billing_period.days(plan.custom_billing_days));

        let license_paid_at = if request.license_paid {
            Some(now)
        } else {
            current.as_ref().and_then(|sub| sub.license_paid_at)
        };
        let license_payment_id = if request.license_paid {
            request.payment_id.clone()
        } else {
            current.as_ref().and_then(|sub| sub.license_payment_id.clone())
        };

        let subscription = OrganizationSubscription {
            id: Uuid::new_v4(),
            organization_id,
            plan_id: plan.id,
            status: SubscriptionStatus::Active,
            started_at: Some(now),
            expires_at: Some(expires_at),
            trial_ends_at: None,
            grace_period_ends_at: None,
            readonly_period_ends_at: None,
            cancelled_at: None,
            billing_period,
            next_maintenance_due_at: Some(expires_at),
            last_maintenance_paid_at: Some(now),
            license_paid_at,
            license_payment_id,
            additional_schools: request.additional_schools,
            currency: request.currency,
            amount_paid_cents: request.amount_paid_cents,
            suspension_reason: None,
            notes: request.notes.clone(),
            metadata: serde_json::Value::Object(metadata),
            created_at: now,
            superseded_at: None,
        };

        self.store
            .replace_subscription(
                current.as_ref().map(|sub| sub.id),
                &subscription,
                request.payment_id.as_deref(),
            )
            .await?;

        self.history
            .record(
                HistoryEntry::new(organization_id, action)
                    .subscription(subscription.id)
                    .plans(current.as_ref().map(|sub| sub.plan_id), Some(plan.id))
                    .statuses(
                        current.as_ref().map(|sub| sub.status),
                        Some(SubscriptionStatus::Active),
                    )
                    .performed_by(request.performed_by)
                    .notes(request.notes.clone().unwrap_or_else(|| {
                        format!("Subscription {} to {}", action, plan.name)
                    }))
                    .metadata(serde_json::json!({
                        "amount_paid_cents": request.amount_paid_cents,
                        "currency": request.currency,
                        "additional_schools": request.additional_schools,
                        "license_paid": request.license_paid,
                    }))
                    .payment(request.payment_id.as_deref()),
            )
            .await;
        self.invalidate_features(organization_id).await;

        tracing::info!(
            org_id = %organization_id,
            plan = %plan.slug,
            action = %action,
            expires_at = %expires_at,
            "Subscription activated"
        );

        notify_quietly(
            self.notifier.as_ref(),
            organization_id,
            Notification::SubscriptionActivated {
                plan_name: plan.name.clone(),
                expires_at: Some(expires_at),
            },
        )
        .await;

        Ok(subscription)
    }

    // ------------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------------

    /// Advance every subscription whose current window has elapsed.
    ///
    /// Rows moved by a concurrent sweep are skipped; running twice with the same
    /// `now` applies nothing the second time.
    pub async fn process_status_transitions(
        &self,
        now: OffsetDateTime,
    ) -> EntitlementResult<TransitionSummary> {
        let mut summary = TransitionSummary::default();

        let running = self
            .store
            .subscriptions_in_status(&[
                SubscriptionStatus::Trial,
                SubscriptionStatus::Active,
                SubscriptionStatus::PendingRenewal,
            ])
            .await?;
        for sub in running
            .into_iter()
            .filter(|sub| sub.expires_at.is_some_and(|expires| expires < now))
        {
            let plan = self.catalog.plan(sub.plan_id);
            let days = grace_days(plan);
            let mut next = sub.clone();
            next.status = SubscriptionStatus::GracePeriod;
            next.grace_period_ends_at = Some(now + Duration::days(i64::from(days)));

            if self
                .apply_transition(&sub, next, HistoryAction::GracePeriod, format!(
                    "Subscription entered {}-day grace period",
                    days
                ))
                .await
            {
                summary.to_grace_period += 1;
                notify_quietly(
                    self.notifier.as_ref(),
                    sub.organization_id,
                    Notification::GracePeriodStarted {
                        grace_period_days: days,
                    },
                )
                .await;
            }
        }

        let in_grace = self
            .store
            .subscriptions_in_status(&[SubscriptionStatus::GracePeriod])
            .await?;
        for sub in in_grace
            .into_iter()
            .filter(|sub| sub.grace_period_ends_at.is_some_and(|end| end < now))
        {
            let plan = self.catalog.plan(sub.plan_id);
            let days = readonly_days(plan);
            let mut next = sub.clone();
            next.status = SubscriptionStatus::Readonly;
            next.readonly_period_ends_at = Some(now + Duration::days(i64::from(days)));

            if self
                .apply_transition(&sub, next, HistoryAction::Readonly, format!(
                    "Subscription entered {}-day readonly period",
                    days
                ))
                .await
            {
                summary.to_readonly += 1;
                notify_quietly(
                    self.notifier.as_ref(),
                    sub.organization_id,
                    Notification::ReadonlyStarted {
                        readonly_period_days: days,
                    },
                )
                .await;
            }
        }

        let readonly = self
            .store
            .subscriptions_in_status(&[SubscriptionStatus::Readonly])
            .await?;
        for sub in readonly
            .into_iter()
            .filter(|sub| sub.readonly_period_ends_at.is_some_and(|end| end < now))
        {
            let mut next = sub.clone();
            next.status = SubscriptionStatus::Expired;

            if self
                .apply_transition(
                    &sub,
                    next,
                    HistoryAction::Expired,
                    "Subscription expired after readonly period".to_string(),
                )
                .await
            {
                summary.to_expired += 1;
                notify_quietly(self.notifier.as_ref(), sub.organization_id, Notification::Expired)
                    .await;
            }
        }

        if summary.total() > 0 {
            tracing::info!(
                to_grace_period = summary.to_grace_period,
                to_readonly = summary.to_readonly,
                to_expired = summary.to_expired,
                "Processed subscription status transitions"
            );
        }

        Ok(summary)
    }

    /// CAS one sweep transition; returns whether it applied
    async fn apply_transition(
        &self,
        previous: &OrganizationSubscription,
        next: OrganizationSubscription,
        action: HistoryAction,
        notes: String,
    ) -> bool {
        match self
            .store
            .update_subscription_if_status(&next, previous.status, None)
            .await
        {
            Ok(true) => {
                self.history
                    .record(
                        HistoryEntry::new(previous.organization_id, action)
                            .subscription(previous.id)
                            .plans(Some(previous.plan_id), Some(previous.plan_id))
                            .statuses(Some(previous.status), Some(next.status))
                            .notes(notes),
                    )
                    .await;
                self.invalidate_features(previous.organization_id).await;
                tracing::info!(
                    org_id = %previous.organization_id,
                    subscription_id = %previous.id,
                    from = %previous.status,
                    to = %next.status,
                    "Subscription status transition"
                );
                true
            }
            Ok(false) => {
                tracing::debug!(
                    subscription_id = %previous.id,
                    "Subscription already transitioned, skipping"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    org_id = %previous.organization_id,
                    subscription_id = %previous.id,
                    error = %e,
                    "Failed to apply subscription transition"
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Manual transitions
    // ------------------------------------------------------------------------

    pub async fn cancel_subscription(
        &self,
        organization_id: Uuid,
        reason: Option<String>,
        performed_by: Option<Uuid>,
    ) -> EntitlementResult<OrganizationSubscription> {
        let current = self.require_current(organization_id).await?;
        let mut updated = current.clone();
        updated.status = SubscriptionStatus::Cancelled;
        updated.cancelled_at = Some(OffsetDateTime::now_utc());
        if reason.is_some() {
            updated.notes = reason.clone();
        }

        self.save_if_status(&updated, current.status, None).await?;

        self.history
            .record(
                HistoryEntry::new(organization_id, HistoryAction::Cancelled)
                    .subscription(current.id)
                    .statuses(Some(current.status), Some(SubscriptionStatus::Cancelled))
                    .performed_by(performed_by)
                    .notes(reason.unwrap_or_else(|| "Subscription cancelled".to_string())),
            )
            .await;
        self.invalidate_features(organization_id).await;

        tracing::info!(org_id = %organization_id, "Subscription cancelled");
        Ok(updated)
    }

    pub async fn suspend_subscription(
        &self,
        organization_id: Uuid,
        reason: String,
        performed_by: Option<Uuid>,
    ) -> EntitlementResult<OrganizationSubscription> {
        let current = self.require_current(organization_id).await?;
        let mut updated = current.clone();
        updated.status = SubscriptionStatus::Suspended;
        updated.suspension_reason = Some(reason.clone());

        self.save_if_status(&updated, current.status, None).await?;

        self.history
            .record(
                HistoryEntry::new(organization_id, HistoryAction::Suspended)
                    .subscription(current.id)
                    .statuses(Some(current.status), Some(SubscriptionStatus::Suspended))
                    .performed_by(performed_by)
                    .notes(reason.clone()),
            )
            .await;
        self.invalidate_features(organization_id).await;

        tracing::warn!(org_id = %organization_id, reason = %reason, "Subscription suspended");

        notify_quietly(
            self.notifier.as_ref(),
            organization_id,
            Notification::Suspended {
                reason: Some(reason),
            },
        )
        .await;

        Ok(updated)
    }

    // ------------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------------

    /// Record a maintenance payment.
    ///
    /// The next due date moves one billing period past the later of the previous
    /// due date and `paid_at`. Rows in the renewal ladder return to `active`.
    pub async fn mark_maintenance_paid(
        &self,
        organization_id: Uuid,
        paid_at: OffsetDateTime,
        payment_id: Option<&str>,
        performed_by: Option<Uuid>,
    ) -> EntitlementResult<OrganizationSubscription> {
        let current = self.require_current(organization_id).await?;
        if current.status == SubscriptionStatus::Cancelled {
            return Err(EntitlementError::InvalidInput(
                "Cannot record maintenance for a cancelled subscription".to_string(),
            ));
        }

        let period_days = current
            .billing_period
            .days(self.catalog.plan(current.plan_id).and_then(|p| p.custom_billing_days));
        let base = current
            .next_maintenance_due_at
            .map_or(paid_at, |due| due.max(paid_at));
        let next_due = base + Duration::days(period_days);

        let mut updated = current.clone();
        updated.last_maintenance_paid_at = Some(paid_at);
        updated.next_maintenance_due_at = Some(next_due);
        updated.expires_at = Some(current.expires_at.map_or(next_due, |e| e.max(next_due)));
        if current.status.is_renewable() {
            updated.status = SubscriptionStatus::Active;
            updated.grace_period_ends_at = None;
            updated.readonly_period_ends_at = None;
        }

        self.save_if_status(&updated, current.status, payment_id).await?;

        self.history
            .record(
                HistoryEntry::new(organization_id, HistoryAction::MaintenancePaid)
                    .subscription(current.id)
                    .statuses(Some(current.status), Some(updated.status))
                    .performed_by(performed_by)
                    .notes(format!("Maintenance paid, next due {}", next_due.date()))
                    .payment(payment_id),
            )
            .await;
        self.invalidate_features(organization_id).await;

        tracing::info!(
            org_id = %organization_id,
            next_due = %next_due,
            "Maintenance payment recorded"
        );
        Ok(updated)
    }

    pub async fn mark_license_paid(
        &self,
        organization_id: Uuid,
        payment_id: Option<&str>,
        performed_by: Option<Uuid>,
    ) -> EntitlementResult<OrganizationSubscription> {
        let current = self.require_current(organization_id).await?;
        let mut updated = current.clone();
        updated.license_paid_at = Some(OffsetDateTime::now_utc());
        updated.license_payment_id = payment_id.map(str::to_string);

        self.save_if_status(&updated, current.status, payment_id).await?;

        self.history
            .record(
                HistoryEntry::new(organization_id, HistoryAction::LicensePaid)
                    .subscription(current.id)
                    .statuses(Some(current.status), Some(current.status))
                    .performed_by(performed_by)
                    .notes("License fee paid")
                    .payment(payment_id),
            )
            .await;
        self.invalidate_features(organization_id).await;

        tracing::info!(org_id = %organization_id, "License payment recorded");
        Ok(updated)
    }

    // ------------------------------------------------------------------------
    // Addons and overrides
    // ------------------------------------------------------------------------

    pub async fn add_feature_addon(
        &self,
        organization_id: Uuid,
        feature_key: &str,
        price_paid_cents: i64,
        currency: Currency,
        performed_by: Option<Uuid>,
    ) -> EntitlementResult<FeatureAddon> {
        let feature_key = self.known_feature(feature_key)?;
        let current = self.require_current(organization_id).await?;
        let now = OffsetDateTime::now_utc();

        let addon = FeatureAddon {
            id: Uuid::new_v4(),
            organization_id,
            feature_key: feature_key.clone(),
            is_enabled: true,
            started_at: Some(now),
            expires_at: current.expires_at,
            price_paid_cents,
            currency,
            created_at: now,
            deleted_at: None,
        };
        self.store.upsert_feature_addon(&addon).await?;

        self.history
            .record(
                HistoryEntry::new(organization_id, HistoryAction::AddonAdded)
                    .subscription(current.id)
                    .performed_by(performed_by)
                    .notes(format!("Added feature addon: {}", feature_key))
                    .metadata(serde_json::json!({
                        "feature_key": feature_key,
                        "price_paid_cents": price_paid_cents,
                        "currency": currency,
                    })),
            )
            .await;
        self.invalidate_features(organization_id).await;

        tracing::info!(org_id = %organization_id, feature = %feature_key, "Feature addon added");
        Ok(addon)
    }

    /// Revoke a feature for one organization regardless of its plan
    pub async fn disable_feature(
        &self,
        organization_id: Uuid,
        feature_key: &str,
        performed_by: Option<Uuid>,
    ) -> EntitlementResult<FeatureAddon> {
        let feature_key = self.known_feature(feature_key)?;
        let current = self.require_current(organization_id).await?;
        let now = OffsetDateTime::now_utc();

        let addon = FeatureAddon {
            id: Uuid::new_v4(),
            organization_id,
            feature_key: feature_key.clone(),
            is_enabled: false,
            started_at: Some(now),
            expires_at: None,
            price_paid_cents: 0,
            currency: current.currency,
            created_at: now,
            deleted_at: None,
        };
        self.store.upsert_feature_addon(&addon).await?;

        self.history
            .record(
                HistoryEntry::new(organization_id, HistoryAction::AddonDisabled)
                    .subscription(current.id)
                    .performed_by(performed_by)
                    .notes(format!("Disabled feature: {}", feature_key)),
            )
            .await;
        self.invalidate_features(organization_id).await;

        tracing::info!(org_id = %organization_id, feature = %feature_key, "Feature disabled");
        Ok(addon)
    }

    fn known_feature(&self, feature_key: &str) -> EntitlementResult<String> {
        let canonical = self.catalog.aliases().canonical(feature_key);
        match self.catalog.definition(canonical) {
            Some(definition) => Ok(definition.feature_key.clone()),
            None => Err(EntitlementError::InvalidInput(format!(
                "Unknown feature: {}",
                feature_key
            ))),
        }
    }

    pub async fn add_limit_override(
        &self,
        organization_id: Uuid,
        request: LimitOverrideRequest,
    ) -> EntitlementResult<LimitOverride> {
        if self.catalog.resource(&request.resource_key).is_none() {
            return Err(EntitlementError::InvalidInput(format!(
                "Unknown resource: {}",
                request.resource_key
            )));
        }
        let current = self.require_current(organization_id).await?;

        let limit_override = LimitOverride {
            id: Uuid::new_v4(),
            organization_id,
            resource_key: request.resource_key.clone(),
            limit_value: request.limit.to_raw(),
            reason: request.reason.clone(),
            granted_by: request.granted_by,
            expires_at: request.expires_at,
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.upsert_limit_override(&limit_override).await?;

        self.history
            .record(
                HistoryEntry::new(organization_id, HistoryAction::LimitOverride)
                    .subscription(current.id)
                    .performed_by(request.granted_by)
                    .notes(format!(
                        "Added limit override for {}: {}",
                        request.resource_key, request.limit
                    ))
                    .metadata(serde_json::json!({
                        "resource_key": request.resource_key,
                        "limit_value": limit_override.limit_value,
                        "reason": request.reason,
                    })),
            )
            .await;

        tracing::info!(
            org_id = %organization_id,
            resource = %limit_override.resource_key,
            limit = %request.limit,
            "Limit override added"
        );
        Ok(limit_override)
    }

    // ------------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------------

    /// Access level right now; lookup failures deny
    pub async fn access_level(&self, organization_id: Uuid) -> AccessLevel {
        match self.store.current_subscription(organization_id).await {
            Ok(sub) => {
                let plan = sub.as_ref().and_then(|s| self.plan_for(s));
                access_level_for(sub.as_ref(), plan, &self.policy, OffsetDateTime::now_utc())
            }
            Err(e) => {
                tracing::warn!(
                    org_id = %organization_id,
                    error = %e,
                    "Failed to load subscription for access check"
                );
                AccessLevel::None
            }
        }
    }

    pub async fn can_read(&self, organization_id: Uuid) -> bool {
        self.access_level(organization_id).await.can_read()
    }

    pub async fn can_write(&self, organization_id: Uuid) -> bool {
        self.access_level(organization_id).await.can_write()
    }

    fn plan_for(&self, sub: &OrganizationSubscription) -> Option<&SubscriptionPlan> {
        let plan = self.catalog.plan(sub.plan_id);
        if plan.is_none() {
            tracing::warn!(
                org_id = %sub.organization_id,
                plan_id = %sub.plan_id,
                "Subscription references unknown plan"
            );
        }
        plan
    }

    pub async fn subscription_status(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<StatusSummary> {
        let Some(sub) = self.store.current_subscription(organization_id).await? else {
            return Ok(StatusSummary::none());
        };

        let now = OffsetDateTime::now_utc();
        let plan = self.plan_for(&sub);
        let access_level = access_level_for(Some(&sub), plan, &self.policy, now);

        Ok(StatusSummary {
            status: Some(sub.status),
            access_level,
            message: status_message(&sub, plan, &self.policy, now),
            can_read: access_level.can_read(),
            can_write: access_level.can_write(),
            plan: plan.map(PlanRef::from),
            started_at: sub.started_at,
            expires_at: sub.expires_at,
            trial_ends_at: sub.trial_ends_at,
            grace_period_ends_at: sub.grace_period_ends_at,
            readonly_period_ends_at: sub.readonly_period_ends_at,
            days_left: sub.days_until_expiry(now),
            trial_days_left: sub.trial_days_left(now),
            is_trial: sub.status == SubscriptionStatus::Trial,
            additional_schools: sub.additional_schools,
            total_schools_allowed: plan.map(|p| sub.total_schools_allowed(p)),
            maintenance_overdue: is_maintenance_overdue(&sub, now),
            maintenance_days_overdue: days_maintenance_overdue(&sub, now),
            maintenance_days_until_due: days_until_maintenance_due(&sub, now),
            next_maintenance_due_at: sub.next_maintenance_due_at,
            license_fee_pending: is_license_pending(&sub, plan),
            license_fee_required: plan.is_some_and(SubscriptionPlan::requires_license_fee),
            license_paid_at: sub.license_paid_at,
        })
    }

    // ------------------------------------------------------------------------
    // Reminders
    // ------------------------------------------------------------------------

    /// Trial and active rows expiring within `days`
    pub async fn subscriptions_needing_reminder(
        &self,
        days: i64,
        now: OffsetDateTime,
    ) -> EntitlementResult<Vec<OrganizationSubscription>> {
        let horizon = now + Duration::days(days);
        Ok(self
            .store
            .subscriptions_in_status(&[SubscriptionStatus::Trial, SubscriptionStatus::Active])
            .await?
            .into_iter()
            .filter(|sub| {
                sub.expires_at
                    .is_some_and(|expires| expires > now && expires <= horizon)
            })
            .collect())
    }

    /// Grace periods ending within `days`
    pub async fn grace_periods_ending(
        &self,
        days: i64,
        now: OffsetDateTime,
    ) -> EntitlementResult<Vec<OrganizationSubscription>> {
        let horizon = now + Duration::days(days);
        Ok(self
            .store
            .subscriptions_in_status(&[SubscriptionStatus::GracePeriod])
            .await?
            .into_iter()
            .filter(|sub| {
                sub.grace_period_ends_at
                    .is_some_and(|end| end > now && end <= horizon)
            })
            .collect())
    }

    /// Notify organizations whose trial, term or grace period ends within `days`
    pub async fn send_expiry_reminders(
        &self,
        days: i64,
        now: OffsetDateTime,
    ) -> EntitlementResult<ReminderSummary> {
        let mut summary = ReminderSummary::default();

        for sub in self.subscriptions_needing_reminder(days, now).await? {
            let days_left = sub.days_until_expiry(now).unwrap_or(0);
            let notification = if sub.status == SubscriptionStatus::Trial {
                summary.trial_ending += 1;
                Notification::TrialEnding { days_left }
            } else {
                summary.renewal_reminders += 1;
                Notification::RenewalReminder { days_left }
            };
            notify_quietly(self.notifier.as_ref(), sub.organization_id, notification).await;
        }

        for sub in self.grace_periods_ending(days, now).await? {
            let days_left = sub
                .grace_period_ends_at
                .map_or(0, |end| (end - now).whole_days().max(0));
            summary.grace_ending += 1;
            notify_quietly(
                self.notifier.as_ref(),
                sub.organization_id,
                Notification::GracePeriodEnding { days_left },
            )
            .await;
        }

        tracing::info!(
            trial_ending = summary.trial_ending,
            renewal_reminders = summary.renewal_reminders,
            grace_ending = summary.grace_ending,
            "Expiry reminders sent"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_catalog, subscription_on, test_engine};

    fn policy() -> LifecyclePolicy {
        LifecyclePolicy::default()
    }

    #[test]
    fn test_no_subscription_has_no_access() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(access_level_for(None, None, &policy(), now), AccessLevel::None);
    }

    #[test]
    fn test_active_expired_forty_days_ago_is_readonly() {
        let catalog = fixture_catalog();
        let plan = catalog.plan_by_slug("starter").unwrap();
        let now = OffsetDateTime::now_utc();

        let mut sub = subscription_on(Uuid::new_v4(), plan, SubscriptionStatus::Active);
        sub.expires_at = Some(now - Duration::days(40));
        // Maintenance settled ahead; only the term has lapsed
        sub.next_maintenance_due_at = Some(now + Duration::days(30));

        let level = access_level_for(Some(&sub), Some(plan), &policy(), now);
        assert_eq!(level, AccessLevel::Readonly);
        assert!(level.can_read());
        assert!(!level.can_write());
    }

    #[test]
    fn test_recently_expired_is_grace() {
        let catalog = fixture_catalog();
        let plan = catalog.plan_by_slug("starter").unwrap();
        let now = OffsetDateTime::now_utc();

        let mut sub = subscription_on(Uuid::new_v4(), plan, SubscriptionStatus::Active);
        sub.expires_at = Some(now - Duration::days(3));
        sub.next_maintenance_due_at = sub.expires_at;

        let level = access_level_for(Some(&sub), Some(plan), &policy(), now);
        assert_eq!(level, AccessLevel::Grace);
        assert!(level.can_write());
    }

    #[test]
    fn test_past_readonly_window_falls_back_to_readonly() {
        let catalog = fixture_catalog();
        let plan = catalog.plan_by_slug("starter").unwrap();
        let now = OffsetDateTime::now_utc();
        let mut sub = subscription_on(Uuid::new_v4(), plan, SubscriptionStatus::Expired);
        sub.next_maintenance_due_at = Some(now + Duration::days(30));

        assert_eq!(
            access_level_for(Some(&sub), Some(plan), &policy(), now),
            AccessLevel::Readonly
        );
    }

    #[test]
    fn test_suspended_and_cancelled_are_blocked() {
        let catalog = fixture_catalog();
        let plan = catalog.plan_by_slug("pro").unwrap();
        let now = OffsetDateTime::now_utc();

        for status in [SubscriptionStatus::Suspended, SubscriptionStatus::Cancelled] {
            let sub = subscription_on(Uuid::new_v4(), plan, status);
            assert_eq!(
                access_level_for(Some(&sub), Some(plan), &policy(), now),
                AccessLevel::Blocked
            );
        }
    }

    #[test]
    fn test_overdue_maintenance_blocks_after_grace() {
        let catalog = fixture_catalog();
        let plan = catalog.plan_by_slug("pro").unwrap();
        let now = OffsetDateTime::now_utc();

        let mut sub = subscription_on(Uuid::new_v4(), plan, SubscriptionStatus::Active);
        sub.next_maintenance_due_at = Some(now - Duration::days(3));
        assert_eq!(
            access_level_for(Some(&sub), Some(plan), &policy(), now),
            AccessLevel::Full
        );

        sub.next_maintenance_due_at = Some(now - Duration::days(10));
        assert_eq!(
            access_level_for(Some(&sub), Some(plan), &policy(), now),
            AccessLevel::Blocked
        );
        assert_eq!(
            status_message(&sub, Some(plan), &policy(), now),
            "Account suspended: Maintenance fee overdue (10 day(s)). Please make payment to restore access."
        );
    }

    #[test]
    fn test_lapsed_term_with_overdue_maintenance_is_blocked() {
        let catalog = fixture_catalog();
        let plan = catalog.plan_by_slug("pro").unwrap();
        let now = OffsetDateTime::now_utc();

        let mut sub = subscription_on(Uuid::new_v4(), plan, SubscriptionStatus::GracePeriod);
        sub.expires_at = Some(now - Duration::days(10));
        sub.next_maintenance_due_at = sub.expires_at;
        sub.grace_period_ends_at = Some(now + Duration::days(4));

        assert_eq!(
            access_level_for(Some(&sub), Some(plan), &policy(), now),
            AccessLevel::Blocked
        );
    }

    #[tokio::test]
    async fn test_activated_plan_blocks_once_maintenance_grace_passes() {
        let t = test_engine();
        let org = Uuid::new_v4();
        let plan = t.plan("pro");

        let mut request = ActivationRequest::new(org, plan.id);
        request.license_paid = true;
        let active = t.engine.lifecycle().activate_subscription(request).await.unwrap();
        let due = active.next_maintenance_due_at.unwrap();

        let within_grace = due + Duration::days(3);
        assert_eq!(
            access_level_for(Some(&active), Some(&plan), &policy(), within_grace),
            AccessLevel::Grace
        );

        for days_late in [10, 30] {
            let later = due + Duration::days(days_late);
            assert_eq!(
                access_level_for(Some(&active), Some(&plan), &policy(), later),
                AccessLevel::Blocked
            );
            assert!(status_message(&active, Some(&plan), &policy(), later)
                .starts_with("Account suspended: Maintenance fee overdue"));
        }
    }

    #[test]
    fn test_unpaid_license_blocks_after_grace() {
        let catalog = fixture_catalog();
        let plan = catalog.plan_by_slug("pro").unwrap();
        let now = OffsetDateTime::now_utc();

        let mut sub = subscription_on(Uuid::new_v4(), plan, SubscriptionStatus::Active);
        sub.license_paid_at = None;
        sub.started_at = Some(now - Duration::days(5));
        assert!(is_license_pending(&sub, Some(plan)));
        assert_eq!(
            access_level_for(Some(&sub), Some(plan), &policy(), now),
            AccessLevel::Full
        );

        sub.started_at = Some(now - Duration::days(20));
        assert_eq!(
            access_level_for(Some(&sub), Some(plan), &policy(), now),
            AccessLevel::Blocked
        );
    }

    #[test]
    fn test_trial_never_owes_license() {
        let catalog = fixture_catalog();
        let plan = catalog.plan_by_slug("pro").unwrap();
        let sub = subscription_on(Uuid::new_v4(), plan, SubscriptionStatus::Trial);
        assert!(!is_license_pending(&sub, Some(plan)));
    }

    #[test]
    fn test_classify_activation() {
        let catalog = fixture_catalog();
        let starter = catalog.plan_by_slug("starter").unwrap();
        let pro = catalog.plan_by_slug("pro").unwrap();
        let org = Uuid::new_v4();

        assert_eq!(
            classify_activation(None, None, pro, Currency::Afn, 0),
            HistoryAction::Activated
        );

        let on_starter = subscription_on(org, starter, SubscriptionStatus::Active);
        assert_eq!(
            classify_activation(Some(&on_starter), Some(starter), pro, Currency::Afn, 0),
            HistoryAction::Upgraded
        );

        let on_pro = subscription_on(org, pro, SubscriptionStatus::Active);
        assert_eq!(
            classify_activation(Some(&on_pro), Some(pro), starter, Currency::Afn, 0),
            HistoryAction::Downgraded
        );

        let in_grace = subscription_on(org, pro, SubscriptionStatus::GracePeriod);
        assert_eq!(
            classify_activation(Some(&in_grace), Some(pro), pro, Currency::Afn, 0),
            HistoryAction::Renewed
        );
    }

    #[tokio::test]
    async fn test_trial_creation_and_duplicate_rejection() {
        let t = test_engine();
        let org = Uuid::new_v4();
        let lifecycle = t.engine.lifecycle();

        let trial = lifecycle.create_trial_subscription(org, None).await.unwrap();
        assert_eq!(trial.status, SubscriptionStatus::Trial);
        assert_eq!(trial.trial_ends_at, trial.expires_at);
        assert_eq!(t.notifier.kinds(), vec!["trial_welcome"]);

        let again = lifecycle.create_trial_subscription(org, None).await;
        assert!(matches!(again, Err(EntitlementError::InvalidInput(_))));

        let history = t.store.history(org).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, HistoryAction::TrialStarted);
        assert_eq!(history[0].notes.as_deref(), Some("Trial started for 7 days"));
    }

    #[tokio::test]
    async fn test_activation_supersedes_trial() {
        let t = test_engine();
        let org = Uuid::new_v4();
        let lifecycle = t.engine.lifecycle();
        let trial = lifecycle.create_trial_subscription(org, None).await.unwrap();

        let mut request = ActivationRequest::new(org, t.plan("pro").id);
        request.license_paid = true;
        request.payment_id = Some("pay_1".to_string());
        let active = lifecycle.activate_subscription(request).await.unwrap();

        assert_eq!(active.status, SubscriptionStatus::Active);
        assert!(active.license_paid_at.is_some());
        assert_eq!(active.next_maintenance_due_at, active.expires_at);

        let rows = t.store.subscription_rows(org).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.id == trial.id && r.superseded_at.is_some()));

        let current = lifecycle.current_subscription(org).await.unwrap().unwrap();
        assert_eq!(current.id, active.id);
        assert!(t.store.payment_applied("pay_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_downgrade_locks_lost_features() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::Active).await;
        let lifecycle = t.engine.lifecycle();

        let mut request = ActivationRequest::new(org, t.plan("starter").id);
        request.license_paid = true;
        let downgraded = lifecycle.activate_subscription(request).await.unwrap();

        let locked = downgraded.locked_features();
        assert!(locked.contains(&"exams".to_string()));
        assert!(locked.contains(&"finance".to_string()));
        assert!(!locked.contains(&"students".to_string()));
        assert_eq!(downgraded.metadata[LOCKED_REASON_KEY], "plan_downgrade");

        let mut upgrade = ActivationRequest::new(org, t.plan("complete").id);
        upgrade.license_paid = true;
        let upgraded = lifecycle.activate_subscription(upgrade).await.unwrap();
        assert!(upgraded.locked_features().is_empty());
        assert!(upgraded.metadata.get(LOCKED_AT_KEY).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_cannot_be_activated() {
        let t = test_engine();
        let org = t.org_on("starter", SubscriptionStatus::Cancelled).await;

        let result = t
            .engine
            .lifecycle()
            .activate_subscription(ActivationRequest::new(org, t.plan("pro").id))
            .await;
        assert!(matches!(result, Err(EntitlementError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_sweep_walks_the_ladder_once() {
        let t = test_engine();
        let lifecycle = t.engine.lifecycle();
        let now = OffsetDateTime::now_utc();

        let org = Uuid::new_v4();
        let mut sub = subscription_on(org, &t.plan("starter"), SubscriptionStatus::Active);
        sub.expires_at = Some(now - Duration::hours(1));
        t.install(&sub).await;

        let first = lifecycle.process_status_transitions(now).await.unwrap();
        assert_eq!(first.to_grace_period, 1);
        let second = lifecycle.process_status_transitions(now).await.unwrap();
        assert_eq!(second.total(), 0);

        let after_grace = now + Duration::days(15);
        let third = lifecycle.process_status_transitions(after_grace).await.unwrap();
        assert_eq!(third.to_readonly, 1);

        let after_readonly = after_grace + Duration::days(61);
        let fourth = lifecycle
            .process_status_transitions(after_readonly)
            .await
            .unwrap();
        assert_eq!(fourth.to_expired, 1);

        let current = lifecycle.current_subscription(org).await.unwrap().unwrap();
        assert_eq!(current.status, SubscriptionStatus::Expired);
        assert_eq!(
            t.notifier.kinds(),
            vec!["grace_period_started", "readonly_started", "expired"]
        );

        let actions: Vec<HistoryAction> = t
            .store
            .history(org)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.action)
            .collect();
        assert_eq!(
            actions,
            vec![HistoryAction::GracePeriod, HistoryAction::Readonly, HistoryAction::Expired]
        );
    }

    #[tokio::test]
    async fn test_maintenance_payment_advances_due_and_restores_active() {
        let t = test_engine();
        let org = t.org_on("starter", SubscriptionStatus::GracePeriod).await;
        let lifecycle = t.engine.lifecycle();
        let before = lifecycle.current_subscription(org).await.unwrap().unwrap();
        let now = OffsetDateTime::now_utc();

        let updated = lifecycle
            .mark_maintenance_paid(org, now, Some("maint_1"), None)
            .await
            .unwrap();

        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert_eq!(updated.next_maintenance_due_at, Some(now + Duration::days(365)));
        assert!(updated.next_maintenance_due_at > before.next_maintenance_due_at);
        assert_eq!(lifecycle.access_level(org).await, AccessLevel::Full);
    }

    #[tokio::test]
    async fn test_suspend_blocks_and_notifies() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::Active).await;
        let lifecycle = t.engine.lifecycle();

        lifecycle
            .suspend_subscription(org, "Chargeback".to_string(), None)
            .await
            .unwrap();

        assert_eq!(lifecycle.access_level(org).await, AccessLevel::Blocked);
        let status = lifecycle.subscription_status(org).await.unwrap();
        assert_eq!(status.message, "Account suspended: Chargeback");
        assert!(!status.can_read);
        assert_eq!(t.notifier.kinds(), vec!["suspended"]);
    }

    #[tokio::test]
    async fn test_status_summary_without_subscription() {
        let t = test_engine();
        let status = t
            .engine
            .lifecycle()
            .subscription_status(Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(status.status, None);
        assert_eq!(status.message, "No active subscription");
        assert_eq!(status.access_level, AccessLevel::None);
    }

    #[tokio::test]
    async fn test_store_failure_denies_access() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::Active).await;
        t.store.set_failing(true);
        assert_eq!(t.engine.lifecycle().access_level(org).await, AccessLevel::None);
    }

    #[tokio::test]
    async fn test_reminders_pick_windows() {
        let t = test_engine();
        let lifecycle = t.engine.lifecycle();
        let now = OffsetDateTime::now_utc();

        let trial_org = Uuid::new_v4();
        let mut trial = subscription_on(trial_org, &t.plan("trial"), SubscriptionStatus::Trial);
        trial.expires_at = Some(now + Duration::days(2));
        t.install(&trial).await;

        let far_org = t.org_on("pro", SubscriptionStatus::Active).await;

        let due = lifecycle.subscriptions_needing_reminder(3, now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].organization_id, trial_org);
        assert!(due.iter().all(|s| s.organization_id != far_org));

        let summary = lifecycle.send_expiry_reminders(3, now).await.unwrap();
        assert_eq!(summary.trial_ending, 1);
        assert_eq!(summary.renewal_reminders, 0);
    }

    #[tokio::test]
    async fn test_unknown_addon_and_resource_rejected() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::Active).await;
        let lifecycle = t.engine.lifecycle();

        let addon = lifecycle
            .add_feature_addon(org, "teleportation", 0, Currency::Afn, None)
            .await;
        assert!(matches!(addon, Err(EntitlementError::InvalidInput(_))));

        let request = LimitOverrideRequest {
            resource_key: "spaceships".to_string(),
            limit: Limit::Value(3),
            reason: None,
            granted_by: None,
            expires_at: None,
        };
        let result = lifecycle.add_limit_override(org, request).await;
        assert!(matches!(result, Err(EntitlementError::InvalidInput(_))));
    }
}
