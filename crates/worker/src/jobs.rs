//! Scheduled job bodies
//!
//! Each job takes the engine and a clock reading so it can be driven directly
//! from tests. Failures are logged; a failed run is retried at the next tick.

use edugate_entitlements::{
    invariants::log_violations, EntitlementEngine, EntitlementResult, EntitlementStore,
    ReminderSummary, SubscriptionStatus, TransitionSummary,
};
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Days ahead of an expiry date that reminders go out
pub const REMINDER_DAYS_AHEAD: i64 = 3;

/// Statuses whose usage counters are worth keeping fresh
const TRACKED_STATUSES: &[SubscriptionStatus] = &[
    SubscriptionStatus::Trial,
    SubscriptionStatus::Active,
    SubscriptionStatus::GracePeriod,
    SubscriptionStatus::Readonly,
];

pub async fn run_lifecycle_sweep(
    engine: &EntitlementEngine,
    now: OffsetDateTime,
) -> Option<TransitionSummary> {
    match engine.lifecycle().process_status_transitions(now).await {
        Ok(summary) => {
            info!(
                to_grace_period = summary.to_grace_period,
                to_readonly = summary.to_readonly,
                to_expired = summary.to_expired,
                "Lifecycle sweep complete"
            );
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Lifecycle sweep failed");
            None
        }
    }
}

pub async fn run_expiry_reminders(
    engine: &EntitlementEngine,
    now: OffsetDateTime,
) -> Option<ReminderSummary> {
    match engine
        .lifecycle()
        .send_expiry_reminders(REMINDER_DAYS_AHEAD, now)
        .await
    {
        Ok(summary) => {
            info!(
                trial_ending = summary.trial_ending,
                renewal_reminders = summary.renewal_reminders,
                grace_ending = summary.grace_ending,
                "Expiry reminders sent"
            );
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Expiry reminder job failed");
            None
        }
    }
}

/// Recount usage for every organization with a live subscription
pub async fn run_usage_recalculation(engine: &EntitlementEngine) -> EntitlementResult<usize> {
    let subscriptions = engine.store().subscriptions_in_status(TRACKED_STATUSES).await?;

    let mut resources = 0;
    for subscription in &subscriptions {
        resources += engine
            .usage()
            .recalculate_usage(subscription.organization_id)
            .await;
    }

    info!(
        organizations = subscriptions.len(),
        resources = resources,
        "Usage recalculation complete"
    );
    Ok(subscriptions.len())
}

pub async fn run_invariant_checks(engine: &EntitlementEngine, now: OffsetDateTime) -> bool {
    match engine.invariants().run_all_checks_at(now).await {
        Ok(summary) => {
            log_violations(&summary);
            if !summary.healthy {
                warn!(
                    violations = summary.violations.len(),
                    "Entitlement data has invariant violations"
                );
            }
            summary.healthy
        }
        Err(e) => {
            error!(error = %e, "Invariant check run failed");
            false
        }
    }
}
