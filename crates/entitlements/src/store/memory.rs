//! In-memory store for tests and local development

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EntitlementStore, UsagePeriod};
use crate::config::ResourceKind;
use crate::error::{EntitlementError, EntitlementResult};
use crate::history::HistoryEntry;
use crate::models::{
    FeatureAddon, LimitOverride, OrganizationSubscription, PlanFeature, PlanLimit,
    SubscriptionPlan, UsageRecord,
};
use crate::types::SubscriptionStatus;

#[derive(Default)]
struct MemoryState {
    plans: Vec<SubscriptionPlan>,
    plan_features: Vec<PlanFeature>,
    plan_limits: Vec<PlanLimit>,
    /// Append-only; superseded rows stay
    subscriptions: Vec<OrganizationSubscription>,
    addons: Vec<FeatureAddon>,
    overrides: HashMap<(Uuid, String), LimitOverride>,
    usage: HashMap<(Uuid, String), UsageRecord>,
    /// Stand-in for the tenant tables counted by `count_resource`
    resource_counts: HashMap<(Uuid, String), i64>,
    history: Vec<HistoryEntry>,
    applied_payments: HashSet<String>,
}

impl MemoryState {
    fn current(&self, organization_id: Uuid) -> Option<&OrganizationSubscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.organization_id == organization_id && s.superseded_at.is_none())
            .max_by_key(|s| s.created_at)
    }

    fn ensure_unclaimed(&self, payment_id: Option<&str>) -> EntitlementResult<()> {
        match payment_id {
            Some(id) if self.applied_payments.contains(id) => {
                Err(EntitlementError::PaymentAlreadyApplied(id.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn claim(&mut self, payment_id: Option<&str>) {
        if let Some(id) = payment_id {
            self.applied_payments.insert(id.to_string());
        }
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    failing: AtomicBool,
    history_failing: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(
        plans: Vec<SubscriptionPlan>,
        plan_features: Vec<PlanFeature>,
        plan_limits: Vec<PlanLimit>,
    ) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                plans,
                plan_features,
                plan_limits,
                ..Default::default()
            }),
            failing: AtomicBool::new(false),
            history_failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with a database error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make only history appends fail
    pub fn set_history_failing(&self, failing: bool) {
        self.history_failing.store(failing, Ordering::SeqCst);
    }

    /// Set the live count `count_resource` reports
    pub async fn set_resource_count(&self, organization_id: Uuid, resource_key: &str, count: i64) {
        let mut state = self.state.write().await;
        state
            .resource_counts
            .insert((organization_id, resource_key.to_string()), count);
    }

    /// Every row for the organization, superseded ones included
    pub async fn subscription_rows(&self, organization_id: Uuid) -> Vec<OrganizationSubscription> {
        let state = self.state.read().await;
        state
            .subscriptions
            .iter()
            .filter(|s| s.organization_id == organization_id)
            .cloned()
            .collect()
    }

    /// Insert a row directly, bypassing the single-current check
    pub async fn insert_subscription_row(&self, subscription: OrganizationSubscription) {
        self.state.write().await.subscriptions.push(subscription);
    }

    pub async fn insert_usage_row(&self, record: UsageRecord) {
        let mut state = self.state.write().await;
        state
            .usage
            .insert((record.organization_id, record.resource_key.clone()), record);
    }

    fn check(&self) -> EntitlementResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EntitlementError::Database("in-memory store set to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for InMemoryStore {
    async fn list_plans(&self) -> EntitlementResult<Vec<SubscriptionPlan>> {
        self.check()?;
        Ok(self.state.read().await.plans.clone())
    }

    async fn list_plan_features(&self) -> EntitlementResult<Vec<PlanFeature>> {
        self.check()?;
        Ok(self.state.read().await.plan_features.clone())
    }

    async fn list_plan_limits(&self) -> EntitlementResult<Vec<PlanLimit>> {
        self.check()?;
        Ok(self.state.read().await.plan_limits.clone())
    }

    async fn current_subscription(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<Option<OrganizationSubscription>> {
        self.check()?;
        Ok(self.state.read().await.current(organization_id).cloned())
    }

    async fn replace_subscription(
        &self,
        previous: Option<Uuid>,
        next: &OrganizationSubscription,
        payment_id: Option<&str>,
    ) -> EntitlementResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        let current_id = state.current(next.organization_id).map(|s| s.id);

        if current_id != previous {
            return Err(EntitlementError::ConcurrentModification(format!(
                "current subscription for organization {} changed",
                next.organization_id
            )));
        }
        state.ensure_unclaimed(payment_id)?;
        state.claim(payment_id);

        if let Some(previous) = previous {
            let superseded_at = next.created_at;
            if let Some(row) = state.subscriptions.iter_mut().find(|s| s.id == previous) {
                row.superseded_at = Some(superseded_at);
            }
        }
        state.subscriptions.push(next.clone());
        Ok(())
    }

    async fn update_subscription_if_status(
        &self,
        subscription: &OrganizationSubscription,
        expected: SubscriptionStatus,
        payment_id: Option<&str>,
    ) -> EntitlementResult<bool> {
        self.check()?;
        let mut state = self.state.write().await;
        let Some(index) = state.subscriptions.iter().position(|s| {
            s.id == subscription.id && s.superseded_at.is_none() && s.status == expected
        }) else {
            return Ok(false);
        };

        state.ensure_unclaimed(payment_id)?;
        state.claim(payment_id);
        state.subscriptions[index] = subscription.clone();
        Ok(true)
    }

    async fn subscriptions_in_status(
        &self,
        statuses: &[SubscriptionStatus],
    ) -> EntitlementResult<Vec<OrganizationSubscription>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.superseded_at.is_none() && statuses.contains(&s.status))
            .cloned()
            .collect())
    }

    async fn organizations_with_multiple_current(&self) -> EntitlementResult<Vec<(Uuid, i64)>> {
        self.check()?;
        let state = self.state.read().await;
        let mut counts: HashMap<Uuid, i64> = HashMap::new();
        for sub in state.subscriptions.iter().filter(|s| s.superseded_at.is_none()) {
            *counts.entry(sub.organization_id).or_default() += 1;
        }
        Ok(counts.into_iter().filter(|(_, n)| *n > 1).collect())
    }

    async fn feature_addons(&self, organization_id: Uuid) -> EntitlementResult<Vec<FeatureAddon>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .addons
            .iter()
            .filter(|a| a.organization_id == organization_id && a.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn all_feature_addons(&self) -> EntitlementResult<Vec<FeatureAddon>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .addons
            .iter()
            .filter(|a| a.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn upsert_feature_addon(&self, addon: &FeatureAddon) -> EntitlementResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        match state.addons.iter_mut().find(|a| {
            a.organization_id == addon.organization_id && a.feature_key == addon.feature_key
        }) {
            Some(existing) => {
                let id = existing.id;
                *existing = addon.clone();
                existing.id = id;
            }
            None => state.addons.push(addon.clone()),
        }
        Ok(())
    }

    async fn limit_override(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<Option<LimitOverride>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .overrides
            .get(&(organization_id, resource_key.to_string()))
            .cloned())
    }

    async fn upsert_limit_override(&self, limit_override: &LimitOverride) -> EntitlementResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        state.overrides.insert(
            (limit_override.organization_id, limit_override.resource_key.clone()),
            limit_override.clone(),
        );
        Ok(())
    }

    async fn usage_record(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<Option<UsageRecord>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .usage
            .get(&(organization_id, resource_key.to_string()))
            .cloned())
    }

    async fn store_usage_count(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        count: i64,
        calculated_at: OffsetDateTime,
    ) -> EntitlementResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        let record = state
            .usage
            .entry((organization_id, resource_key.to_string()))
            .or_insert_with(|| empty_record(organization_id, resource_key, calculated_at));
        record.current_count = count;
        record.last_calculated_at = calculated_at;
        Ok(())
    }

    async fn reset_usage_period(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        period: UsagePeriod,
        now: OffsetDateTime,
    ) -> EntitlementResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        let record = state
            .usage
            .entry((organization_id, resource_key.to_string()))
            .or_insert_with(|| empty_record(organization_id, resource_key, now));
        record.current_count = 0;
        record.period_start = Some(period.start);
        record.period_end = Some(period.end);
        record.last_calculated_at = now;
        record.last_warning_sent_at = None;
        Ok(())
    }

    async fn adjust_usage(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        delta: i64,
        period: Option<UsagePeriod>,
        now: OffsetDateTime,
    ) -> EntitlementResult<i64> {
        self.check()?;
        let mut state = self.state.write().await;
        let record = state
            .usage
            .entry((organization_id, resource_key.to_string()))
            .or_insert_with(|| {
                let mut record = empty_record(organization_id, resource_key, now);
                record.period_start = period.map(|p| p.start);
                record.period_end = period.map(|p| p.end);
                record
            });
        record.current_count = (record.current_count + delta).max(0);
        record.last_calculated_at = now;
        Ok(record.current_count)
    }

    async fn claim_limit_notification(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        now: OffsetDateTime,
        cooldown: Duration,
    ) -> EntitlementResult<bool> {
        self.check()?;
        let mut state = self.state.write().await;
        let record = state
            .usage
            .entry((organization_id, resource_key.to_string()))
            .or_insert_with(|| empty_record(organization_id, resource_key, now));
        let claimable = record
            .last_warning_sent_at
            .map_or(true, |sent| sent + cooldown <= now);
        if claimable {
            record.last_warning_sent_at = Some(now);
        }
        Ok(claimable)
    }

    async fn count_resource(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        _kind: &ResourceKind,
    ) -> EntitlementResult<i64> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .resource_counts
            .get(&(organization_id, resource_key.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn negative_usage_rows(&self) -> EntitlementResult<Vec<(Uuid, String, i64)>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .usage
            .values()
            .filter(|r| r.current_count < 0)
            .map(|r| (r.organization_id, r.resource_key.clone(), r.current_count))
            .collect())
    }

    async fn append_history(&self, entry: &HistoryEntry) -> EntitlementResult<()> {
        self.check()?;
        if self.history_failing.load(Ordering::SeqCst) {
            return Err(EntitlementError::Database("history table unavailable".to_string()));
        }
        self.state.write().await.history.push(entry.clone());
        Ok(())
    }

    async fn history(&self, organization_id: Uuid) -> EntitlementResult<Vec<HistoryEntry>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn payment_applied(&self, payment_id: &str) -> EntitlementResult<bool> {
        self.check()?;
        Ok(self.state.read().await.applied_payments.contains(payment_id))
    }
}

fn empty_record(organization_id: Uuid, resource_key: &str, now: OffsetDateTime) -> UsageRecord {
    UsageRecord {
        organization_id,
        resource_key: resource_key.to_string(),
        current_count: 0,
        period_start: None,
        period_end: None,
        last_calculated_at: now,
        last_warning_sent_at: None,
    }
}
