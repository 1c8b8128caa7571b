//! Entitlement invariants
//!
//! Runnable consistency checks over subscriptions, usage and addons. Checks
//! only read; the worker runs them daily and logs violations by severity.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::EntitlementResult;
use crate::lifecycle::readonly_period_end;
use crate::store::EntitlementStore;
use crate::types::SubscriptionStatus;

const CHECKS_RUN: usize = 5;

/// Statuses that still grant some access
const LIVE_STATUSES: &[SubscriptionStatus] = &[
    SubscriptionStatus::Trial,
    SubscriptionStatus::Active,
    SubscriptionStatus::PendingRenewal,
    SubscriptionStatus::GracePeriod,
    SubscriptionStatus::Readonly,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub org_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Access decisions may be wrong
    Critical,
    High,
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub struct InvariantChecker {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<PlanCatalog>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn EntitlementStore>, catalog: Arc<PlanCatalog>) -> Self {
        Self { store, catalog }
    }

    pub async fn run_all_checks(&self) -> EntitlementResult<InvariantCheckSummary> {
        self.run_all_checks_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_all_checks_at(
        &self,
        now: OffsetDateTime,
    ) -> EntitlementResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_single_current_subscription().await?);
        let live = self.store.subscriptions_in_status(LIVE_STATUSES).await?;
        violations.extend(self.check_plans_exist(&live));
        violations.extend(self.check_usage_not_negative().await?);
        violations.extend(self.check_no_stale_live_rows(&live, now));
        violations.extend(self.check_addon_features_exist().await?);

        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: CHECKS_RUN,
            checks_passed: CHECKS_RUN - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one current subscription per organization
    async fn check_single_current_subscription(
        &self,
    ) -> EntitlementResult<Vec<InvariantViolation>> {
        let rows = self.store.organizations_with_multiple_current().await?;

        Ok(rows
            .into_iter()
            .map(|(org_id, count)| InvariantViolation {
                invariant: "single_current_subscription".to_string(),
                org_ids: vec![org_id],
                description: format!(
                    "Organization has {} current subscriptions (expected 1)",
                    count
                ),
                context: serde_json::json!({ "subscription_count": count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    fn check_plans_exist(
        &self,
        live: &[crate::models::OrganizationSubscription],
    ) -> Vec<InvariantViolation> {
        live.iter()
            .filter(|sub| self.catalog.plan(sub.plan_id).is_none())
            .map(|sub| InvariantViolation {
                invariant: "subscription_plan_exists".to_string(),
                org_ids: vec![sub.organization_id],
                description: format!("Subscription references unknown plan {}", sub.plan_id),
                context: serde_json::json!({
                    "subscription_id": sub.id,
                    "plan_id": sub.plan_id,
                    "status": sub.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect()
    }

    async fn check_usage_not_negative(&self) -> EntitlementResult<Vec<InvariantViolation>> {
        let rows = self.store.negative_usage_rows().await?;

        Ok(rows
            .into_iter()
            .map(|(org_id, resource_key, count)| InvariantViolation {
                invariant: "usage_not_negative".to_string(),
                org_ids: vec![org_id],
                description: format!("Usage for '{}' is negative ({})", resource_key, count),
                context: serde_json::json!({
                    "resource_key": resource_key,
                    "current_count": count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Rows past their readonly window should have been expired by the sweep
    fn check_no_stale_live_rows(
        &self,
        live: &[crate::models::OrganizationSubscription],
        now: OffsetDateTime,
    ) -> Vec<InvariantViolation> {
        live.iter()
            .filter_map(|sub| {
                let plan = self.catalog.plan(sub.plan_id);
                let end = readonly_period_end(sub, plan)?;
                (end < now).then(|| InvariantViolation {
                    invariant: "no_stale_live_subscription".to_string(),
                    org_ids: vec![sub.organization_id],
                    description: format!(
                        "Subscription is still '{}' after its readonly period ended",
                        sub.status
                    ),
                    context: serde_json::json!({
                        "subscription_id": sub.id,
                        "status": sub.status,
                        "readonly_period_ends_at": end.to_string(),
                    }),
                    severity: ViolationSeverity::Medium,
                })
            })
            .collect()
    }

    async fn check_addon_features_exist(&self) -> EntitlementResult<Vec<InvariantViolation>> {
        let addons = self.store.all_feature_addons().await?;
        let aliases = self.catalog.aliases();

        Ok(addons
            .into_iter()
            .filter(|addon| addon.deleted_at.is_none())
            .filter(|addon| {
                self.catalog
                    .definition(aliases.canonical(&addon.feature_key))
                    .is_none()
            })
            .map(|addon| InvariantViolation {
                invariant: "addon_feature_exists".to_string(),
                org_ids: vec![addon.organization_id],
                description: format!("Addon references unknown feature '{}'", addon.feature_key),
                context: serde_json::json!({
                    "addon_id": addon.id,
                    "feature_key": addon.feature_key,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }
}

/// Log each violation at a level matching its severity
pub fn log_violations(summary: &InvariantCheckSummary) {
    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => tracing::error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                org_ids = ?violation.org_ids,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium => tracing::warn!(
                invariant = %violation.invariant,
                org_ids = ?violation.org_ids,
                "{}",
                violation.description
            ),
            ViolationSeverity::Low => tracing::info!(
                invariant = %violation.invariant,
                org_ids = ?violation.org_ids,
                "{}",
                violation.description
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureAddon, OrganizationSubscription, UsageRecord};
    use crate::test_support::{fixture_catalog, fixture_store, subscription_on};
    use crate::types::Currency;
    use time::Duration;

    fn checker() -> (Arc<crate::store::InMemoryStore>, InvariantChecker) {
        let store = Arc::new(fixture_store());
        let checker = InvariantChecker::new(store.clone(), Arc::new(fixture_catalog()));
        (store, checker)
    }

    fn plan_row(slug: &str) -> crate::models::SubscriptionPlan {
        fixture_catalog().plan_by_slug(slug).unwrap().clone()
    }

    #[tokio::test]
    async fn test_clean_store_is_healthy() {
        let (store, checker) = checker();
        let org = Uuid::new_v4();
        store
            .insert_subscription_row(subscription_on(
                org,
                &plan_row("pro"),
                SubscriptionStatus::Active,
            ))
            .await;

        let summary = checker.run_all_checks().await.unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.checks_run, 5);
        assert_eq!(summary.checks_passed, 5);
    }

    #[tokio::test]
    async fn test_two_current_rows_is_critical() {
        let (store, checker) = checker();
        let org = Uuid::new_v4();
        let plan = plan_row("starter");
        store
            .insert_subscription_row(subscription_on(org, &plan, SubscriptionStatus::Active))
            .await;
        store
            .insert_subscription_row(subscription_on(org, &plan, SubscriptionStatus::Trial))
            .await;

        let summary = checker.run_all_checks().await.unwrap();
        assert!(!summary.healthy);
        let violation = summary
            .violations
            .iter()
            .find(|v| v.invariant == "single_current_subscription")
            .unwrap();
        assert_eq!(violation.severity, ViolationSeverity::Critical);
        assert_eq!(violation.org_ids, vec![org]);
    }

    #[tokio::test]
    async fn test_unknown_plan_and_stale_row() {
        let (store, checker) = checker();

        let mut orphan: OrganizationSubscription =
            subscription_on(Uuid::new_v4(), &plan_row("pro"), SubscriptionStatus::Active);
        orphan.plan_id = Uuid::new_v4();
        store.insert_subscription_row(orphan).await;

        let mut stale =
            subscription_on(Uuid::new_v4(), &plan_row("pro"), SubscriptionStatus::Readonly);
        stale.readonly_period_ends_at = Some(OffsetDateTime::now_utc() - Duration::days(1));
        store.insert_subscription_row(stale).await;

        let summary = checker.run_all_checks().await.unwrap();
        let severities: Vec<(&str, ViolationSeverity)> = summary
            .violations
            .iter()
            .map(|v| (v.invariant.as_str(), v.severity))
            .collect();
        assert!(severities.contains(&("subscription_plan_exists", ViolationSeverity::High)));
        assert!(severities.contains(&("no_stale_live_subscription", ViolationSeverity::Medium)));
        assert_eq!(summary.checks_failed, 2);
    }

    #[tokio::test]
    async fn test_negative_usage_and_unknown_addon() {
        let (store, checker) = checker();
        let org = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        store
            .insert_usage_row(UsageRecord {
                organization_id: org,
                resource_key: "questions".to_string(),
                current_count: -3,
                period_start: None,
                period_end: None,
                last_calculated_at: now,
                last_warning_sent_at: None,
            })
            .await;
        store
            .upsert_feature_addon(&FeatureAddon {
                id: Uuid::new_v4(),
                organization_id: org,
                feature_key: "teleportation".to_string(),
                is_enabled: true,
                started_at: Some(now),
                expires_at: None,
                price_paid_cents: 0,
                currency: Currency::Afn,
                created_at: now,
                deleted_at: None,
            })
            .await
            .unwrap();

        let summary = checker.run_all_checks().await.unwrap();
        let usage = summary
            .violations
            .iter()
            .find(|v| v.invariant == "usage_not_negative")
            .unwrap();
        assert_eq!(usage.severity, ViolationSeverity::High);
        assert_eq!(usage.context["current_count"], -3);

        let addon = summary
            .violations
            .iter()
            .find(|v| v.invariant == "addon_feature_exists")
            .unwrap();
        assert_eq!(addon.severity, ViolationSeverity::Low);
        log_violations(&summary);
    }
}
