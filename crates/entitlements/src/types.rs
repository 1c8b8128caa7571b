//! Shared enums and value types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EntitlementError;

/// Lifecycle status of an organization subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PendingRenewal,
    GracePeriod,
    Readonly,
    Expired,
    Suspended,
    Cancelled,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 8] = [
        SubscriptionStatus::Trial,
        SubscriptionStatus::Active,
        SubscriptionStatus::PendingRenewal,
        SubscriptionStatus::GracePeriod,
        SubscriptionStatus::Readonly,
        SubscriptionStatus::Expired,
        SubscriptionStatus::Suspended,
        SubscriptionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PendingRenewal => "pending_renewal",
            SubscriptionStatus::GracePeriod => "grace_period",
            SubscriptionStatus::Readonly => "readonly",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses the time-based sweep moves into the grace period once expired
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trial
                | SubscriptionStatus::Active
                | SubscriptionStatus::PendingRenewal
        )
    }

    /// Statuses that may be renewed back onto the same plan
    pub fn is_renewable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::PendingRenewal
                | SubscriptionStatus::GracePeriod
                | SubscriptionStatus::Readonly
                | SubscriptionStatus::Expired
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = EntitlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubscriptionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                EntitlementError::InvalidInput(format!("Unknown subscription status: {}", s))
            })
    }
}

/// Billing cadence of a plan or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
    Custom,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Yearly => "yearly",
            BillingPeriod::Custom => "custom",
        }
    }

    /// Length of one period in days. Custom periods fall back to a year when unset.
    pub fn days(&self, custom_days: Option<i32>) -> i64 {
        match self {
            BillingPeriod::Monthly => 30,
            BillingPeriod::Yearly => 365,
            BillingPeriod::Custom => custom_days.filter(|d| *d > 0).map(i64::from).unwrap_or(365),
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Afn,
    Usd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Afn => "AFN",
            Currency::Usd => "USD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Organization-wide access level derived from the current subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// No subscription at all
    None,
    /// Suspended for payment or administratively blocked
    Blocked,
    Readonly,
    Grace,
    Full,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::Blocked => "blocked",
            AccessLevel::Readonly => "readonly",
            AccessLevel::Grace => "grace",
            AccessLevel::Full => "full",
        }
    }

    pub fn can_read(&self) -> bool {
        matches!(self, AccessLevel::Full | AccessLevel::Grace | AccessLevel::Readonly)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, AccessLevel::Full | AccessLevel::Grace)
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Access to a single feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureAccessLevel {
    Full,
    Readonly,
    None,
}

/// Why a feature is denied or restricted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    NoSubscription,
    SubscriptionBlocked,
    DependencyMissing,
    LockedReadonly,
    FeatureNotInPlan,
    /// Subscription or plan could not be loaded
    LookupFailed,
}

/// Effective limit for a resource.
///
/// Persisted limit values use `-1` for unlimited and `0` for disabled; those
/// sentinels never leave the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Limit {
    Unlimited,
    Disabled,
    Value(u64),
}

impl Limit {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            n if n < 0 => Limit::Unlimited,
            0 => Limit::Disabled,
            n => Limit::Value(n as u64),
        }
    }

    pub fn to_raw(&self) -> i64 {
        match self {
            Limit::Unlimited => -1,
            Limit::Disabled => 0,
            Limit::Value(n) => i64::try_from(*n).unwrap_or(i64::MAX),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    /// Raise a finite limit by `extra`; unlimited stays unlimited.
    pub fn plus(self, extra: u64) -> Self {
        match self {
            Limit::Unlimited => Limit::Unlimited,
            Limit::Disabled if extra == 0 => Limit::Disabled,
            Limit::Disabled => Limit::Value(extra),
            Limit::Value(n) => Limit::Value(n.saturating_add(extra)),
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => write!(f, "unlimited"),
            Limit::Disabled => write!(f, "0"),
            Limit::Value(n) => write!(f, "{}", n),
        }
    }
}

/// Reset cadence for accumulator resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPeriod {
    Monthly,
    Yearly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_sentinels_decode() {
        assert_eq!(Limit::from_raw(-1), Limit::Unlimited);
        assert_eq!(Limit::from_raw(0), Limit::Disabled);
        assert_eq!(Limit::from_raw(250), Limit::Value(250));
        assert_eq!(Limit::Unlimited.to_raw(), -1);
        assert_eq!(Limit::Value(600).to_raw(), 600);
    }

    #[test]
    fn test_limit_plus_additional_schools() {
        assert_eq!(Limit::Value(1).plus(2), Limit::Value(3));
        assert_eq!(Limit::Unlimited.plus(5), Limit::Unlimited);
        assert_eq!(Limit::Disabled.plus(0), Limit::Disabled);
    }

    #[test]
    fn test_limit_serializes_as_tagged_variant() {
        let json = serde_json::to_value(Limit::Value(5)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "value", "value": 5}));
        let json = serde_json::to_value(Limit::Unlimited).unwrap();
        assert_eq!(json, serde_json::json!({"type": "unlimited"}));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in SubscriptionStatus::ALL {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_access_level_read_write() {
        assert!(AccessLevel::Grace.can_write());
        assert!(!AccessLevel::Readonly.can_write());
        assert!(AccessLevel::Readonly.can_read());
        assert!(!AccessLevel::Blocked.can_read());
        assert!(!AccessLevel::None.can_read());
    }

    #[test]
    fn test_billing_period_days() {
        assert_eq!(BillingPeriod::Monthly.days(None), 30);
        assert_eq!(BillingPeriod::Yearly.days(Some(10)), 365);
        assert_eq!(BillingPeriod::Custom.days(Some(90)), 90);
        assert_eq!(BillingPeriod::Custom.days(None), 365);
    }
}
