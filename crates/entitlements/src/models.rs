//! Persisted rows: plans, subscriptions, addons, overrides, usage

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::types::{BillingPeriod, Currency, Limit, SubscriptionStatus};

/// Metadata key holding features locked read-only after a downgrade
pub const LOCKED_FEATURES_KEY: &str = "locked_features";

/// Trial length when the trial plan leaves it unset
pub const DEFAULT_TRIAL_DAYS: i32 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    /// One-time license fee
    pub license_fee_afn_cents: i64,
    pub license_fee_usd_cents: i64,
    /// Recurring fee per billing period
    pub maintenance_fee_afn_cents: i64,
    pub maintenance_fee_usd_cents: i64,
    /// Recurring fee per school beyond the first
    pub per_school_maintenance_afn_cents: i64,
    pub per_school_maintenance_usd_cents: i64,
    pub trial_days: i32,
    pub grace_period_days: i32,
    pub readonly_period_days: i32,
    pub billing_period: BillingPeriod,
    pub custom_billing_days: Option<i32>,
    pub max_schools: i32,
    pub sort_order: i32,
    pub is_active: bool,
    pub is_custom: bool,
}

impl SubscriptionPlan {
    pub fn billing_period_days(&self) -> i64 {
        self.billing_period.days(self.custom_billing_days)
    }

    pub fn license_fee(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Afn => self.license_fee_afn_cents,
            Currency::Usd => self.license_fee_usd_cents,
        }
    }

    pub fn maintenance_fee(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Afn => self.maintenance_fee_afn_cents,
            Currency::Usd => self.maintenance_fee_usd_cents,
        }
    }

    pub fn per_school_maintenance_fee(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Afn => self.per_school_maintenance_afn_cents,
            Currency::Usd => self.per_school_maintenance_usd_cents,
        }
    }

    pub fn requires_license_fee(&self) -> bool {
        self.license_fee_afn_cents > 0 || self.license_fee_usd_cents > 0
    }

    /// License plus first-period maintenance for every school, used to rank plan changes
    pub fn total_initial_cost(&self, currency: Currency, additional_schools: i32) -> i64 {
        self.license_fee(currency)
            + self.maintenance_fee(currency)
            + self.per_school_maintenance_fee(currency) * i64::from(additional_schools.max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlanFeature {
    pub plan_id: Uuid,
    pub feature_key: String,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlanLimit {
    pub plan_id: Uuid,
    pub resource_key: String,
    /// `-1` unlimited, `0` disabled
    pub limit_value: i64,
    pub warning_threshold: i32,
}

impl PlanLimit {
    pub fn limit(&self) -> Limit {
        Limit::from_raw(self.limit_value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrganizationSubscription {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
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
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub billing_period: BillingPeriod,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_maintenance_due_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_maintenance_paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub license_paid_at: Option<OffsetDateTime>,
    pub license_payment_id: Option<String>,
    pub additional_schools: i32,
    pub currency: Currency,
    pub amount_paid_cents: i64,
    pub suspension_reason: Option<String>,
    pub notes: Option<String>,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub superseded_at: Option<OffsetDateTime>,
}

impl OrganizationSubscription {
    /// Fresh trial row; the caller persists it.
    pub fn new_trial(organization_id: Uuid, plan: &SubscriptionPlan, now: OffsetDateTime) -> Self {
        let trial_days = if plan.trial_days > 0 {
            plan.trial_days
        } else {
            DEFAULT_TRIAL_DAYS
        };
        let trial_end = now + Duration::days(i64::from(trial_days));
        Self {
            id: Uuid::new_v4(),
            organization_id,
            plan_id: plan.id,
            status: SubscriptionStatus::Trial,
            started_at: Some(now),
            expires_at: Some(trial_end),
            trial_ends_at: Some(trial_end),
            grace_period_ends_at: None,
            readonly_period_ends_at: None,
            cancelled_at: None,
            billing_period: plan.billing_period,
            next_maintenance_due_at: None,
            last_maintenance_paid_at: None,
            license_paid_at: None,
            license_payment_id: None,
            additional_schools: 0,
            currency: Currency::Afn,
            amount_paid_cents: 0,
            suspension_reason: None,
            notes: None,
            metadata: serde_json::json!({}),
            created_at: now,
            superseded_at: None,
        }
    }

    pub fn is_current(&self) -> bool {
        self.superseded_at.is_none()
    }

    /// Features kept read-only after a downgrade
    pub fn locked_features(&self) -> Vec<String> {
        self.metadata
            .get(LOCKED_FEATURES_KEY)
            .and_then(|v| v.as_array())
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whole days until `expires_at`, floored at zero
    pub fn days_until_expiry(&self, now: OffsetDateTime) -> Option<i64> {
        self.expires_at
            .map(|expires| (expires - now).whole_days().max(0))
    }

    pub fn trial_days_left(&self, now: OffsetDateTime) -> Option<i64> {
        if self.status != SubscriptionStatus::Trial {
            return None;
        }
        self.trial_ends_at.map(|end| (end - now).whole_days().max(0))
    }

    pub fn total_schools_allowed(&self, plan: &SubscriptionPlan) -> i64 {
        i64::from(plan.max_schools) + i64::from(self.additional_schools)
    }
}

/// Per-organization feature grant (`is_enabled = true`) or revocation (`false`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeatureAddon {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub feature_key: String,
    pub is_enabled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub price_paid_cents: i64,
    pub currency: Currency,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl FeatureAddon {
    fn is_live(&self, now: OffsetDateTime) -> bool {
        self.deleted_at.is_none() && self.expires_at.map_or(true, |expires| expires > now)
    }

    pub fn grants(&self, now: OffsetDateTime) -> bool {
        self.is_enabled && self.is_live(now)
    }

    pub fn revokes(&self, now: OffsetDateTime) -> bool {
        !self.is_enabled && self.is_live(now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LimitOverride {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub resource_key: String,
    pub limit_value: i64,
    pub reason: Option<String>,
    pub granted_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl LimitOverride {
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }

    pub fn limit(&self) -> Limit {
        Limit::from_raw(self.limit_value)
    }
}

/// Cached count (countable resources) or running total (accumulators, storage)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageRecord {
    pub organization_id: Uuid,
    pub resource_key: String,
    pub current_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_calculated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_warning_sent_at: Option<OffsetDateTime>,
}

impl UsageRecord {
    pub fn is_fresh(&self, ttl: Duration, now: OffsetDateTime) -> bool {
        self.last_calculated_at + ttl > now
    }

    pub fn period_elapsed(&self, now: OffsetDateTime) -> bool {
        self.period_end.is_some_and(|end| now >= end)
    }
}

/// Catalog entry describing a feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDefinition {
    pub feature_key: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: String,
    #[serde(default)]
    pub is_addon: bool,
    #[serde(default)]
    pub addon_price_yearly_afn_cents: i64,
    #[serde(default)]
    pub addon_price_yearly_usd_cents: i64,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Features that must also be enabled
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

fn default_true() -> bool {
    true
}

impl FeatureDefinition {
    pub fn addon_price(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Afn => self.addon_price_yearly_afn_cents,
            Currency::Usd => self.addon_price_yearly_usd_cents,
        }
    }
}
