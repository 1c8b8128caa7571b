//! Persistence seam
//!
//! Every read and write the engine performs goes through [`EntitlementStore`].
//! `PgEntitlementStore` is the production implementation; `InMemoryStore` backs
//! tests and local runs.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgEntitlementStore;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::ResourceKind;
use crate::error::EntitlementResult;
use crate::history::HistoryEntry;
use crate::models::{
    FeatureAddon, LimitOverride, OrganizationSubscription, PlanFeature, PlanLimit,
    SubscriptionPlan, UsageRecord,
};
use crate::types::SubscriptionStatus;

/// Usage window for accumulator resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsagePeriod {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    // Plans

    async fn list_plans(&self) -> EntitlementResult<Vec<SubscriptionPlan>>;

    async fn list_plan_features(&self) -> EntitlementResult<Vec<PlanFeature>>;

    async fn list_plan_limits(&self) -> EntitlementResult<Vec<PlanLimit>>;

    // Subscriptions

    /// Most recent non-superseded row for the organization
    async fn current_subscription(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<Option<OrganizationSubscription>>;

    /// Supersede `previous` (when given) and insert `next` atomically, claiming
    /// `payment_id` in the same write.
    ///
    /// Fails with `ConcurrentModification` when `previous` is no longer current or
    /// another current row appeared for the organization, and with
    /// `PaymentAlreadyApplied` when the payment id was claimed before.
    async fn replace_subscription(
        &self,
        previous: Option<Uuid>,
        next: &OrganizationSubscription,
        payment_id: Option<&str>,
    ) -> EntitlementResult<()>;

    /// Write `subscription` only if the stored row is still current and in
    /// `expected` status. Returns whether the write applied.
    ///
    /// `payment_id` is claimed together with the write; a repeated id fails with
    /// `PaymentAlreadyApplied` and leaves the row untouched.
    async fn update_subscription_if_status(
        &self,
        subscription: &OrganizationSubscription,
        expected: SubscriptionStatus,
        payment_id: Option<&str>,
    ) -> EntitlementResult<bool>;

    /// Current rows in any of the given statuses
    async fn subscriptions_in_status(
        &self,
        statuses: &[SubscriptionStatus],
    ) -> EntitlementResult<Vec<OrganizationSubscription>>;

    /// Organizations holding more than one current row, with the row count
    async fn organizations_with_multiple_current(&self) -> EntitlementResult<Vec<(Uuid, i64)>>;

    // Addons and overrides

    /// Non-deleted addons for the organization, expired ones included
    async fn feature_addons(&self, organization_id: Uuid) -> EntitlementResult<Vec<FeatureAddon>>;

    async fn all_feature_addons(&self) -> EntitlementResult<Vec<FeatureAddon>>;

    /// Insert or replace the addon keyed by (organization_id, feature_key)
    async fn upsert_feature_addon(&self, addon: &FeatureAddon) -> EntitlementResult<()>;

    async fn limit_override(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<Option<LimitOverride>>;

    /// Insert or replace the override keyed by (organization_id, resource_key)
    async fn upsert_limit_override(&self, limit_override: &LimitOverride) -> EntitlementResult<()>;

    // Usage

    async fn usage_record(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<Option<UsageRecord>>;

    /// Upsert a freshly calculated count, leaving period and warning fields alone
    async fn store_usage_count(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        count: i64,
        calculated_at: OffsetDateTime,
    ) -> EntitlementResult<()>;

    /// Zero the running total and start a new period
    async fn reset_usage_period(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        period: UsagePeriod,
        now: OffsetDateTime,
    ) -> EntitlementResult<()>;

    /// Atomically add `delta` (floored at zero), creating the row with `period`
    /// when missing. Returns the new total.
    async fn adjust_usage(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        delta: i64,
        period: Option<UsagePeriod>,
        now: OffsetDateTime,
    ) -> EntitlementResult<i64>;

    /// Claim the right to send a limit notification. Returns `true` when no
    /// notification was recorded within `cooldown` of `now`.
    async fn claim_limit_notification(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        now: OffsetDateTime,
        cooldown: Duration,
    ) -> EntitlementResult<bool>;

    /// Live count of a countable resource
    async fn count_resource(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        kind: &ResourceKind,
    ) -> EntitlementResult<i64>;

    /// (organization_id, resource_key, current_count) for rows below zero
    async fn negative_usage_rows(&self) -> EntitlementResult<Vec<(Uuid, String, i64)>>;

    // History

    async fn append_history(&self, entry: &HistoryEntry) -> EntitlementResult<()>;

    async fn history(&self, organization_id: Uuid) -> EntitlementResult<Vec<HistoryEntry>>;

    // Payments

    /// Whether a subscription write already claimed this payment id
    async fn payment_applied(&self, payment_id: &str) -> EntitlementResult<bool>;
}
