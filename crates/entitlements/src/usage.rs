//! Usage and limit tracking
//!
//! Three kinds of resource are measured:
//! - countable resources are counted from their owning table and cached in
//!   `usage_current` for a short TTL
//! - accumulators are running totals moved by `increment`/`decrement`, reset when
//!   their monthly or yearly period elapses
//! - storage is summed across backends and stored in GB scaled by 10,000
//!
//! Limit checks fail open: an internal error never stops an organization from
//! creating records.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{PlanCatalog, PlanRef};
use crate::config::{EngineConfig, ResourceDefinition, ResourceKind};
use crate::error::{EntitlementError, EntitlementResult};
use crate::features::FeatureLookup;
use crate::models::{OrganizationSubscription, SubscriptionPlan};
use crate::notifications::{notify_quietly, Notification, Notifier};
use crate::storage_usage::{stored_to_gb, StorageCalculator};
use crate::store::{EntitlementStore, UsagePeriod};
use crate::types::{Limit, ResetPeriod};

const SCHOOLS_RESOURCE: &str = "schools";
const NOTIFICATION_COOLDOWN_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSettings {
    /// How long a counted value stays fresh in `usage_current`
    pub cache_ttl: Duration,
    pub default_warning_threshold: u8,
    /// Minimum spacing between limit notifications for one resource
    pub notification_cooldown: Duration,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for UsageSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            cache_ttl: Duration::seconds(
                i64::try_from(config.usage_cache_ttl.as_secs()).unwrap_or(i64::MAX),
            ),
            default_warning_threshold: config.default_warning_threshold,
            notification_cooldown: Duration::hours(NOTIFICATION_COOLDOWN_HOURS),
        }
    }
}

fn first_of_month(year: i32, month: Month) -> EntitlementResult<OffsetDateTime> {
    Ok(Date::from_calendar_date(year, month, 1)?
        .midnight()
        .assume_utc())
}

/// Calendar month containing `now`, in UTC
pub fn monthly_period(now: OffsetDateTime) -> EntitlementResult<UsagePeriod> {
    let now = now.to_offset(time::UtcOffset::UTC);
    let start = first_of_month(now.year(), now.month())?;
    let end = if now.month() == Month::December {
        first_of_month(now.year() + 1, Month::January)?
    } else {
        first_of_month(now.year(), now.month().next())?
    };
    Ok(UsagePeriod { start, end })
}

/// Calendar year containing `now`, in UTC
pub fn yearly_period(now: OffsetDateTime) -> EntitlementResult<UsagePeriod> {
    let now = now.to_offset(time::UtcOffset::UTC);
    Ok(UsagePeriod {
        start: first_of_month(now.year(), Month::January)?,
        end: first_of_month(now.year() + 1, Month::January)?,
    })
}

pub fn period_for(reset: ResetPeriod, now: OffsetDateTime) -> EntitlementResult<UsagePeriod> {
    match reset {
        ResetPeriod::Monthly => monthly_period(now),
        ResetPeriod::Yearly => yearly_period(now),
    }
}

/// Outcome of a limit check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCheck {
    pub resource_key: String,
    pub allowed: bool,
    /// GB for storage, a count otherwise
    pub current: f64,
    pub limit: Limit,
    /// `None` when unlimited
    pub remaining: Option<f64>,
    pub percentage: f64,
    pub warning: bool,
    pub message: Option<String>,
}

impl UsageCheck {
    fn fail_open(resource_key: &str) -> Self {
        Self {
            resource_key: resource_key.to_string(),
            allowed: true,
            current: 0.0,
            limit: Limit::Unlimited,
            remaining: None,
            percentage: 0.0,
            warning: false,
            message: None,
        }
    }
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Compare usage against a limit
pub fn evaluate_usage(
    resource_key: &str,
    resource_name: &str,
    current: f64,
    limit: Limit,
    warning_threshold: u8,
) -> UsageCheck {
    let name = resource_name.to_lowercase();
    match limit {
        Limit::Unlimited => UsageCheck {
            resource_key: resource_key.to_string(),
            allowed: true,
            current,
            limit,
            remaining: None,
            percentage: 0.0,
            warning: false,
            message: None,
        },
        Limit::Disabled => UsageCheck {
            resource_key: resource_key.to_string(),
            allowed: false,
            current,
            limit,
            remaining: Some(0.0),
            percentage: 100.0,
            warning: false,
            message: Some("This feature is not available on your current plan.".to_string()),
        },
        Limit::Value(max) => {
            let max_f = max as f64;
            let percentage = round_one_decimal(current / max_f * 100.0);
            let allowed = current < max_f;
            let warning = percentage >= f64::from(warning_threshold) && percentage < 100.0;

            let message = if !allowed {
                Some(format!(
                    "You have reached your {} limit ({}). Please upgrade your plan to add more.",
                    name, max
                ))
            } else if warning {
                Some(format!(
                    "You are using {}% of your {} limit ({}/{}).",
                    percentage, name, current, max
                ))
            } else {
                None
            };

            UsageCheck {
                resource_key: resource_key.to_string(),
                allowed,
                current,
                limit,
                remaining: Some((max_f - current).max(0.0)),
                percentage,
                warning,
                message,
            }
        }
    }
}

/// Per-resource usage row for dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub resource_key: String,
    pub name: String,
    pub unit: String,
    pub current: f64,
    pub limit: Limit,
    pub remaining: Option<f64>,
    pub percentage: f64,
    pub warning: bool,
    pub allowed: bool,
    pub unlimited: bool,
}

impl ResourceUsage {
    fn from_check(definition: &ResourceDefinition, check: UsageCheck) -> Self {
        Self {
            resource_key: check.resource_key,
            name: definition.name.clone(),
            unit: definition.unit.clone(),
            current: check.current,
            unlimited: check.limit.is_unlimited(),
            limit: check.limit,
            remaining: check.remaining,
            percentage: check.percentage,
            warning: check.warning,
            allowed: check.allowed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub organization_id: Uuid,
    pub plan: Option<PlanRef>,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub resources: Vec<ResourceUsage>,
}

pub struct UsageTracker {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<PlanCatalog>,
    features: Arc<dyn FeatureLookup>,
    storage: StorageCalculator,
    notifier: Arc<dyn Notifier>,
    settings: UsageSettings,
}

impl UsageTracker {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        catalog: Arc<PlanCatalog>,
        features: Arc<dyn FeatureLookup>,
        storage: StorageCalculator,
        notifier: Arc<dyn Notifier>,
        settings: UsageSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            features,
            storage,
            notifier,
            settings,
        }
    }

    fn definition(&self, resource_key: &str) -> EntitlementResult<&ResourceDefinition> {
        self.catalog
            .resource(resource_key)
            .ok_or_else(|| {
                EntitlementError::InvalidInput(format!("Unknown resource: {}", resource_key))
            })
    }

    /// First gating feature when none of the resource's gating features is enabled
    async fn blocking_feature(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<Option<String>> {
        let gating = self.catalog.gating_features(resource_key);
        for feature in gating {
            if self.features.feature_enabled(organization_id, feature).await? {
                return Ok(None);
            }
        }
        Ok(gating.first().cloned())
    }

    fn plan_for(&self, sub: &OrganizationSubscription) -> Option<&SubscriptionPlan> {
        let plan = self.catalog.plan(sub.plan_id);
        if plan.is_none() {
            tracing::warn!(
                org_id = %sub.organization_id,
                plan_id = %sub.plan_id,
                "Subscription plan missing from catalog, treating limits as disabled"
            );
        }
        plan
    }

    // ------------------------------------------------------------------------
    // Limits
    // ------------------------------------------------------------------------

    async fn try_limit(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<Limit> {
        let Some(sub) = self.store.current_subscription(organization_id).await? else {
            return Ok(Limit::Disabled);
        };

        if self.blocking_feature(organization_id, resource_key).await?.is_some() {
            return Ok(Limit::Disabled);
        }

        let now = OffsetDateTime::now_utc();
        if let Some(limit_override) = self
            .store
            .limit_override(organization_id, resource_key)
            .await?
            .filter(|o| o.is_active(now))
        {
            return Ok(limit_override.limit());
        }

        let Some(plan) = self.plan_for(&sub) else {
            return Ok(Limit::Disabled);
        };

        let declared = self.catalog.plan_limit(plan.id, resource_key);
        if resource_key == SCHOOLS_RESOURCE {
            let base = declared.unwrap_or_else(|| Limit::from_raw(i64::from(plan.max_schools)));
            let extra = u64::try_from(sub.additional_schools).unwrap_or(0);
            return Ok(base.plus(extra));
        }

        Ok(declared.unwrap_or(Limit::Unlimited))
    }

    /// Effective limit; lookup failures allow unlimited use
    pub async fn limit(&self, organization_id: Uuid, resource_key: &str) -> Limit {
        match self.try_limit(organization_id, resource_key).await {
            Ok(limit) => limit,
            Err(e) => {
                tracing::warn!(
                    org_id = %organization_id,
                    resource = %resource_key,
                    error = %e,
                    "Limit lookup failed, allowing unlimited use"
                );
                Limit::Unlimited
            }
        }
    }

    pub async fn warning_threshold(&self, organization_id: Uuid, resource_key: &str) -> u8 {
        let plan_threshold = match self.store.current_subscription(organization_id).await {
            Ok(Some(sub)) => self.catalog.warning_threshold(sub.plan_id, resource_key),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    org_id = %organization_id,
                    resource = %resource_key,
                    error = %e,
                    "Warning threshold lookup failed, using default"
                );
                None
            }
        };
        plan_threshold.unwrap_or(self.settings.default_warning_threshold)
    }

    // ------------------------------------------------------------------------
    // Measurement
    // ------------------------------------------------------------------------

    /// Current usage: a count, or GB for storage
    pub async fn current_usage(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<f64> {
        let definition = self.definition(resource_key)?;
        let now = OffsetDateTime::now_utc();

        match &definition.kind {
            ResourceKind::Countable { .. } => {
                let record = self.store.usage_record(organization_id, resource_key).await?;
                if let Some(record) = record.filter(|r| r.is_fresh(self.settings.cache_ttl, now)) {
                    return Ok(record.current_count as f64);
                }
                let count = self
                    .refresh_count(organization_id, resource_key, &definition.kind, now)
                    .await?;
                Ok(count as f64)
            }
            ResourceKind::Accumulator { reset } => {
                let record = self.store.usage_record(organization_id, resource_key).await?;
                match (reset, record) {
                    (Some(reset), Some(record)) if record.period_elapsed(now) => {
                        let period = period_for(*reset, now)?;
                        self.store
                            .reset_usage_period(organization_id, resource_key, period, now)
                            .await?;
                        tracing::debug!(
                            org_id = %organization_id,
                            resource = %resource_key,
                            "Usage period reset"
                        );
                        Ok(0.0)
                    }
                    (_, Some(record)) => Ok(record.current_count as f64),
                    (_, None) => Ok(0.0),
                }
            }
            ResourceKind::Storage => {
                let record = self.store.usage_record(organization_id, resource_key).await?;
                if let Some(record) = record
                    .as_ref()
                    .filter(|r| r.is_fresh(self.settings.cache_ttl, now))
                {
                    return Ok(stored_to_gb(record.current_count));
                }
                match (self.storage.usage_stored(organization_id).await, record) {
                    (Ok(stored), _) => {
                        self.store
                            .store_usage_count(organization_id, resource_key, stored, now)
                            .await?;
                        Ok(stored_to_gb(stored))
                    }
                    // A failed measurement never replaces the stored one
                    (Err(e), Some(record)) => {
                        tracing::warn!(
                            org_id = %organization_id,
                            error = %e,
                            "Storage measurement failed, using last recorded usage"
                        );
                        Ok(stored_to_gb(record.current_count))
                    }
                    (Err(e), None) => Err(e),
                }
            }
        }
    }

    async fn refresh_count(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        kind: &ResourceKind,
        now: OffsetDateTime,
    ) -> EntitlementResult<i64> {
        let count = self
            .store
            .count_resource(organization_id, resource_key, kind)
            .await?;
        self.store
            .store_usage_count(organization_id, resource_key, count, now)
            .await?;
        Ok(count)
    }

    /// Force-refresh every countable resource and storage.
    ///
    /// Returns how many resources were refreshed; failures are logged and skipped.
    pub async fn recalculate_usage(&self, organization_id: Uuid) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut refreshed = 0;

        for (resource_key, definition) in self.catalog.resources() {
            let result = match &definition.kind {
                ResourceKind::Countable { .. } => self
                    .refresh_count(organization_id, resource_key, &definition.kind, now)
                    .await
                    .map(|_| ()),
                ResourceKind::Storage => match self.storage.usage_stored(organization_id).await {
                    Ok(stored) => {
                        self.store
                            .store_usage_count(organization_id, resource_key, stored, now)
                            .await
                    }
                    Err(e) => Err(e),
                },
                ResourceKind::Accumulator { .. } => continue,
            };

            match result {
                Ok(()) => refreshed += 1,
                Err(e) => {
                    tracing::warn!(
                        org_id = %organization_id,
                        resource = %resource_key,
                        error = %e,
                        "Failed to recalculate usage"
                    );
                }
            }
        }

        tracing::debug!(org_id = %organization_id, refreshed = refreshed, "Usage recalculated");
        refreshed
    }

    // ------------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------------

    async fn try_can_create(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<UsageCheck> {
        let definition = self.definition(resource_key)?;

        if definition.kind != ResourceKind::Storage {
            if let Some(feature) = self.blocking_feature(organization_id, resource_key).await? {
                return Ok(UsageCheck {
                    resource_key: resource_key.to_string(),
                    allowed: false,
                    current: 0.0,
                    limit: Limit::Disabled,
                    remaining: Some(0.0),
                    percentage: 0.0,
                    warning: false,
                    message: Some(
                        EntitlementError::FeatureUnavailable {
                            name: self.catalog.feature_name(&feature),
                            feature,
                        }
                        .to_string(),
                    ),
                });
            }
        }

        let limit = self.try_limit(organization_id, resource_key).await?;
        let current = self.current_usage(organization_id, resource_key).await?;
        let threshold = self.warning_threshold(organization_id, resource_key).await;

        Ok(evaluate_usage(
            resource_key,
            &definition.name,
            current,
            limit,
            threshold,
        ))
    }

    /// Whether one more record may be created; internal errors allow it
    pub async fn can_create(&self, organization_id: Uuid, resource_key: &str) -> UsageCheck {
        match self.try_can_create(organization_id, resource_key).await {
            Ok(check) => {
                self.notify_threshold(organization_id, &check).await;
                check
            }
            Err(e) => {
                tracing::warn!(
                    org_id = %organization_id,
                    resource = %resource_key,
                    error = %e,
                    "Usage check failed, allowing creation"
                );
                UsageCheck::fail_open(resource_key)
            }
        }
    }

    pub async fn assert_can_create(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<UsageCheck> {
        let check = self.can_create(organization_id, resource_key).await;
        if check.allowed {
            return Ok(check);
        }
        Err(EntitlementError::LimitReached {
            resource: resource_key.to_string(),
            message: check
                .message
                .unwrap_or_else(|| format!("Limit reached for {}", resource_key)),
        })
    }

    async fn notify_threshold(&self, organization_id: Uuid, check: &UsageCheck) {
        let Limit::Value(limit) = check.limit else {
            return;
        };

        let notification = if !check.allowed {
            Notification::LimitReached {
                resource: check.resource_key.clone(),
                limit,
            }
        } else if check.warning {
            Notification::LimitWarning {
                resource: check.resource_key.clone(),
                current: check.current,
                limit,
                percentage: check.percentage,
            }
        } else {
            return;
        };

        let claimed = self
            .store
            .claim_limit_notification(
                organization_id,
                &check.resource_key,
                OffsetDateTime::now_utc(),
                self.settings.notification_cooldown,
            )
            .await;

        match claimed {
            Ok(true) => notify_quietly(self.notifier.as_ref(), organization_id, notification).await,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    org_id = %organization_id,
                    resource = %check.resource_key,
                    error = %e,
                    "Failed to record limit notification"
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Accumulators
    // ------------------------------------------------------------------------

    /// Add to an accumulator's running total. Countable resources and storage
    /// are measured, not counted, so they return `None`.
    pub async fn increment(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        amount: i64,
    ) -> EntitlementResult<Option<i64>> {
        let definition = self.definition(resource_key)?;
        let ResourceKind::Accumulator { reset } = &definition.kind else {
            tracing::debug!(
                resource = %resource_key,
                "Ignoring manual usage change for a measured resource"
            );
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        let period = match reset {
            Some(reset) => {
                let period = period_for(*reset, now)?;
                let elapsed = self
                    .store
                    .usage_record(organization_id, resource_key)
                    .await?
                    .is_some_and(|r| r.period_elapsed(now));
                if elapsed {
                    self.store
                        .reset_usage_period(organization_id, resource_key, period, now)
                        .await?;
                }
                Some(period)
            }
            None => None,
        };

        let total = self
            .store
            .adjust_usage(organization_id, resource_key, amount, period, now)
            .await?;
        Ok(Some(total))
    }

    /// Subtract from an accumulator, never below zero
    pub async fn decrement(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        amount: i64,
    ) -> EntitlementResult<Option<i64>> {
        self.increment(organization_id, resource_key, -amount.abs())
            .await
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    /// Usage for every tracked resource; resources behind a disabled feature are omitted
    pub async fn all_usage(&self, organization_id: Uuid) -> EntitlementResult<Vec<ResourceUsage>> {
        let mut usage = Vec::new();

        for (resource_key, definition) in self.catalog.resources() {
            if self.blocking_feature(organization_id, resource_key).await?.is_some() {
                continue;
            }

            let limit = self.try_limit(organization_id, resource_key).await?;
            let current = self.current_usage(organization_id, resource_key).await?;
            let threshold = self.warning_threshold(organization_id, resource_key).await;
            let check = evaluate_usage(resource_key, &definition.name, current, limit, threshold);
            usage.push(ResourceUsage::from_check(definition, check));
        }

        Ok(usage)
    }

    /// Resources at their warning threshold or already blocked
    pub async fn warnings(&self, organization_id: Uuid) -> EntitlementResult<Vec<ResourceUsage>> {
        Ok(self
            .all_usage(organization_id)
            .await?
            .into_iter()
            .filter(|u| u.warning || (!u.allowed && matches!(u.limit, Limit::Value(_))))
            .collect())
    }

    pub async fn snapshot(&self, organization_id: Uuid) -> EntitlementResult<UsageSnapshot> {
        let plan = self
            .store
            .current_subscription(organization_id)
            .await?
            .and_then(|sub| self.catalog.plan(sub.plan_id).map(PlanRef::from));

        Ok(UsageSnapshot {
            organization_id,
            plan,
            captured_at: OffsetDateTime::now_utc(),
            resources: self.all_usage(organization_id).await?,
        })
    }
}
