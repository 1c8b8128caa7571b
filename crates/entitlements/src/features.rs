//! Feature entitlement resolution
//!
//! [`FeatureGate`] is the only place that decides whether an organization may
//! use a feature. A feature is granted by the plan (including every lower plan
//! in the order), by an enabling addon, and is taken away by a disabling addon.
//! Granted features still need their prerequisites; features lost in a
//! downgrade stay readable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::FeatureCache;
use crate::catalog::{PlanCatalog, PlanRef};
use crate::error::{EntitlementError, EntitlementResult};
use crate::lifecycle::{access_level_for, LifecyclePolicy};
use crate::models::{FeatureDefinition, OrganizationSubscription};
use crate::store::EntitlementStore;
use crate::types::{AccessLevel, AccessReason, FeatureAccessLevel};

/// Feature checks needed by other components, kept behind a trait so the
/// usage tracker does not depend on the gate directly
#[async_trait]
pub trait FeatureLookup: Send + Sync {
    /// Whether the feature is fully usable; lookup errors are returned, not denied
    async fn feature_enabled(
        &self,
        organization_id: Uuid,
        feature_key: &str,
    ) -> EntitlementResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureAccess {
    /// Canonical key
    pub feature_key: String,
    pub allowed: bool,
    pub access_level: FeatureAccessLevel,
    pub reason: Option<AccessReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_dependencies: Vec<String>,
    pub required_plan: Option<PlanRef>,
}

impl FeatureAccess {
    fn granted(feature_key: &str) -> Self {
        Self {
            feature_key: feature_key.to_string(),
            allowed: true,
            access_level: FeatureAccessLevel::Full,
            reason: None,
            missing_dependencies: Vec::new(),
            required_plan: None,
        }
    }

    fn denied(feature_key: &str, reason: AccessReason) -> Self {
        Self {
            feature_key: feature_key.to_string(),
            allowed: false,
            access_level: FeatureAccessLevel::None,
            reason: Some(reason),
            missing_dependencies: Vec::new(),
            required_plan: None,
        }
    }
}

/// Catalog entry decorated with the organization's access, for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStatus {
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub parent: Option<String>,
    pub is_addon: bool,
    pub addon_price_yearly_afn_cents: i64,
    pub addon_price_yearly_usd_cents: i64,
    pub can_purchase_addon: bool,
    #[serde(flatten)]
    pub access: FeatureAccess,
}

/// Everything one organization's feature decisions depend on
struct AccessContext {
    subscription: OrganizationSubscription,
    level: AccessLevel,
    enabled: HashSet<String>,
    locked: HashSet<String>,
}

pub struct FeatureGate {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<PlanCatalog>,
    cache: Arc<dyn FeatureCache>,
    policy: LifecyclePolicy,
}

impl FeatureGate {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        catalog: Arc<PlanCatalog>,
        cache: Arc<dyn FeatureCache>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            store,
            catalog,
            cache,
            policy,
        }
    }

    /// Every key variant of every enabled feature, cached per organization
    pub async fn enabled_features(&self, organization_id: Uuid) -> EntitlementResult<Vec<String>> {
        match self.cache.get(organization_id).await {
            Ok(Some(features)) => return Ok(features),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    org_id = %organization_id,
                    error = %e,
                    "Feature cache read failed, resolving from store"
                );
            }
        }

        let subscription = self.store.current_subscription(organization_id).await?;
        let features = match subscription {
            Some(sub) => self.resolve_enabled(&sub).await?,
            None => Vec::new(),
        };

        if let Err(e) = self.cache.put(organization_id, &features).await {
            tracing::warn!(
                org_id = %organization_id,
                error = %e,
                "Failed to cache enabled features"
            );
        }
        Ok(features)
    }

    async fn resolve_enabled(
        &self,
        sub: &OrganizationSubscription,
    ) -> EntitlementResult<Vec<String>> {
        let aliases = self.catalog.aliases();
        let now = OffsetDateTime::now_utc();

        if self.catalog.plan(sub.plan_id).is_none() {
            tracing::warn!(
                org_id = %sub.organization_id,
                plan_id = %sub.plan_id,
                "Subscription plan missing from catalog, no plan features granted"
            );
        }

        let mut canonical: HashSet<String> = self
            .catalog
            .inherited_feature_keys(sub.plan_id)
            .iter()
            .map(|key| aliases.canonical(key).to_string())
            .collect();

        let addons = self.store.feature_addons(sub.organization_id).await?;
        for addon in addons.iter().filter(|a| a.grants(now)) {
            canonical.insert(aliases.canonical(&addon.feature_key).to_string());
        }
        for addon in addons.iter().filter(|a| a.revokes(now)) {
            canonical.remove(aliases.canonical(&addon.feature_key));
        }

        let expanded: BTreeSet<String> = canonical
            .iter()
            .flat_map(|key| aliases.variants(key))
            .collect();
        Ok(expanded.into_iter().collect())
    }

    async fn context(&self, organization_id: Uuid) -> EntitlementResult<Option<AccessContext>> {
        let Some(subscription) = self.store.current_subscription(organization_id).await? else {
            return Ok(None);
        };

        let plan = self.catalog.plan(subscription.plan_id);
        let level = access_level_for(
            Some(&subscription),
            plan,
            &self.policy,
            OffsetDateTime::now_utc(),
        );

        let aliases = self.catalog.aliases();
        let enabled = self
            .enabled_features(organization_id)
            .await?
            .iter()
            .map(|key| aliases.canonical(key).to_string())
            .collect();
        let locked = subscription
            .locked_features()
            .iter()
            .map(|key| aliases.canonical(key).to_string())
            .collect();

        Ok(Some(AccessContext {
            subscription,
            level,
            enabled,
            locked,
        }))
    }

    fn evaluate(&self, context: Option<&AccessContext>, canonical: &str) -> FeatureAccess {
        let Some(context) = context else {
            return FeatureAccess::denied(canonical, AccessReason::NoSubscription);
        };

        if context.level == AccessLevel::Blocked {
            return FeatureAccess::denied(canonical, AccessReason::SubscriptionBlocked);
        }

        if context.enabled.contains(canonical) {
            let missing = self
                .catalog
                .graph()
                .missing_dependencies(canonical, &context.enabled);
            if missing.is_empty() {
                return FeatureAccess::granted(canonical);
            }

            let required_plan = missing
                .first()
                .and_then(|dependency| self.catalog.minimum_plan_for(dependency));
            return FeatureAccess {
                missing_dependencies: missing,
                required_plan,
                ..FeatureAccess::denied(canonical, AccessReason::DependencyMissing)
            };
        }

        let required_plan = self.catalog.minimum_plan_for(canonical);
        if context.locked.contains(canonical) {
            return FeatureAccess {
                allowed: true,
                access_level: FeatureAccessLevel::Readonly,
                reason: Some(AccessReason::LockedReadonly),
                missing_dependencies: Vec::new(),
                required_plan,
                feature_key: canonical.to_string(),
            };
        }

        FeatureAccess {
            required_plan,
            ..FeatureAccess::denied(canonical, AccessReason::FeatureNotInPlan)
        }
    }

    /// Access outcome for one feature; lookup failures deny
    pub async fn feature_access_status(
        &self,
        organization_id: Uuid,
        feature_key: &str,
    ) -> FeatureAccess {
        let canonical = self.catalog.aliases().canonical(feature_key).to_string();

        match self.context(organization_id).await {
            Ok(context) => self.evaluate(context.as_ref(), &canonical),
            Err(e) => {
                tracing::warn!(
                    org_id = %organization_id,
                    feature = %canonical,
                    error = %e,
                    "Feature lookup failed, denying"
                );
                FeatureAccess::denied(&canonical, AccessReason::LookupFailed)
            }
        }
    }

    pub async fn has_feature(&self, organization_id: Uuid, feature_key: &str) -> bool {
        self.feature_access_status(organization_id, feature_key)
            .await
            .allowed
    }

    pub async fn assert_feature(
        &self,
        organization_id: Uuid,
        feature_key: &str,
    ) -> EntitlementResult<()> {
        let access = self.feature_access_status(organization_id, feature_key).await;
        if access.allowed {
            return Ok(());
        }
        Err(EntitlementError::FeatureUnavailable {
            name: self.catalog.feature_name(&access.feature_key),
            feature: access.feature_key,
        })
    }

    /// Every active catalog feature with the organization's access to it
    pub async fn all_features_status(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<Vec<FeatureStatus>> {
        let context = self.context(organization_id).await?;
        let can_buy = context
            .as_ref()
            .is_some_and(|c| c.level != AccessLevel::Blocked && c.subscription.is_current());

        Ok(self
            .catalog
            .definitions()
            .iter()
            .filter(|definition| definition.is_active)
            .map(|definition| {
                let access = self.evaluate(context.as_ref(), &definition.feature_key);
                FeatureStatus {
                    name: definition.name.clone(),
                    description: definition.description.clone(),
                    category: definition.category.clone(),
                    parent: definition.parent.clone(),
                    is_addon: definition.is_addon,
                    addon_price_yearly_afn_cents: definition.addon_price_yearly_afn_cents,
                    addon_price_yearly_usd_cents: definition.addon_price_yearly_usd_cents,
                    can_purchase_addon: can_buy
                        && definition.is_addon
                        && access.access_level != FeatureAccessLevel::Full,
                    access,
                }
            })
            .collect())
    }

    /// Addon-eligible features the organization does not have yet
    pub async fn available_addons(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<Vec<FeatureDefinition>> {
        let aliases = self.catalog.aliases();
        let enabled: HashSet<String> = self
            .enabled_features(organization_id)
            .await?
            .iter()
            .map(|key| aliases.canonical(key).to_string())
            .collect();

        Ok(self
            .catalog
            .definitions()
            .iter()
            .filter(|d| d.is_active && d.is_addon && !enabled.contains(&d.feature_key))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FeatureLookup for FeatureGate {
    async fn feature_enabled(
        &self,
        organization_id: Uuid,
        feature_key: &str,
    ) -> EntitlementResult<bool> {
        let canonical = self.catalog.aliases().canonical(feature_key).to_string();
        let context = self.context(organization_id).await?;
        Ok(self.evaluate(context.as_ref(), &canonical).access_level == FeatureAccessLevel::Full)
    }
}
