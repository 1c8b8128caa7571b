//! Plan catalog
//!
//! Snapshot of plans, their feature sets and limits, plus the static feature
//! catalog. Loaded once at startup; `minimum_plan_for` results are memoized in a
//! cache owned by the catalog.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use crate::aliases::FeatureAliases;
use crate::config::{CatalogConfig, ResourceDefinition};
use crate::dependencies::FeatureGraph;
use crate::error::EntitlementResult;
use crate::models::{FeatureDefinition, PlanFeature, PlanLimit, SubscriptionPlan};
use crate::store::EntitlementStore;
use crate::types::{Currency, Limit};

/// Threshold used when a plan declares no limit row for a resource
pub const FALLBACK_WARNING_THRESHOLD: u8 = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRef {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
}

impl From<&SubscriptionPlan> for PlanRef {
    fn from(plan: &SubscriptionPlan) -> Self {
        Self {
            id: plan.id,
            slug: plan.slug.clone(),
            name: plan.name.clone(),
        }
    }
}

/// Price quote for a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub currency: Currency,
    pub license_fee_cents: i64,
    pub maintenance_fee_cents: i64,
    pub additional_schools: i32,
    pub additional_schools_fee_cents: i64,
    pub total_maintenance_cents: i64,
    pub total_cents: i64,
    pub billing_period_days: i64,
}

/// Memoized `minimum_plan_for` answers, keyed by canonical feature
#[derive(Debug, Default)]
pub struct MinimumPlanCache {
    entries: Mutex<HashMap<String, Option<PlanRef>>>,
}

impl MinimumPlanCache {
    fn get(&self, key: &str) -> Option<Option<PlanRef>> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(key).cloned()
    }

    fn insert(&self, key: String, value: Option<PlanRef>) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(key, value);
    }

    pub fn clear(&self) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.clear();
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct PlanCatalog {
    plans: HashMap<Uuid, SubscriptionPlan>,
    plan_ids_by_slug: HashMap<String, Uuid>,
    features_by_plan: HashMap<Uuid, HashSet<String>>,
    limits_by_plan: HashMap<Uuid, HashMap<String, PlanLimit>>,
    plan_order: Vec<String>,
    definitions: Vec<FeatureDefinition>,
    aliases: FeatureAliases,
    graph: FeatureGraph,
    resources: HashMap<String, ResourceDefinition>,
    limit_feature_map: HashMap<String, Vec<String>>,
    minimum_plans: MinimumPlanCache,
}

impl PlanCatalog {
    pub fn new(
        config: CatalogConfig,
        plans: Vec<SubscriptionPlan>,
        features: Vec<PlanFeature>,
        limits: Vec<PlanLimit>,
    ) -> Self {
        let aliases = FeatureAliases::new(config.aliases);
        let graph = FeatureGraph::from_definitions(&config.features, &aliases);

        let mut features_by_plan: HashMap<Uuid, HashSet<String>> = HashMap::new();
        for feature in features.into_iter().filter(|f| f.is_enabled) {
            features_by_plan
                .entry(feature.plan_id)
                .or_default()
                .insert(feature.feature_key);
        }

        let mut limits_by_plan: HashMap<Uuid, HashMap<String, PlanLimit>> = HashMap::new();
        for limit in limits {
            limits_by_plan
                .entry(limit.plan_id)
                .or_default()
                .insert(limit.resource_key.clone(), limit);
        }

        let plan_ids_by_slug = plans.iter().map(|p| (p.slug.clone(), p.id)).collect();
        let plans = plans.into_iter().map(|p| (p.id, p)).collect();

        let mut definitions = config.features;
        definitions.sort_by_key(|d| d.sort_order);

        Self {
            plans,
            plan_ids_by_slug,
            features_by_plan,
            limits_by_plan,
            plan_order: config.plan_order,
            definitions,
            aliases,
            graph,
            resources: config.resources,
            limit_feature_map: config.limit_feature_map,
            minimum_plans: MinimumPlanCache::default(),
        }
    }

    /// Snapshot plans, plan features and plan limits from the store
    pub async fn load(
        store: &dyn EntitlementStore,
        config: CatalogConfig,
    ) -> EntitlementResult<Self> {
        let plans = store.list_plans().await?;
        let features = store.list_plan_features().await?;
        let limits = store.list_plan_limits().await?;

        tracing::info!(
            plans = plans.len(),
            plan_features = features.len(),
            plan_limits = limits.len(),
            "Plan catalog loaded"
        );

        Ok(Self::new(config, plans, features, limits))
    }

    pub fn plan(&self, plan_id: Uuid) -> Option<&SubscriptionPlan> {
        self.plans.get(&plan_id)
    }

    pub fn plan_by_slug(&self, slug: &str) -> Option<&SubscriptionPlan> {
        self.plan_ids_by_slug
            .get(slug)
            .and_then(|id| self.plans.get(id))
    }

    /// Active, non-custom plans ordered for display
    pub fn available_plans(&self) -> Vec<&SubscriptionPlan> {
        let mut plans: Vec<&SubscriptionPlan> = self
            .plans
            .values()
            .filter(|p| p.is_active && !p.is_custom)
            .collect();
        plans.sort_by_key(|p| (p.sort_order, p.slug.clone()));
        plans
    }

    pub fn feature_keys(&self, plan_id: Uuid) -> HashSet<String> {
        self.features_by_plan
            .get(&plan_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Plan features unioned with every lower plan in `plan_order`
    pub fn inherited_feature_keys(&self, plan_id: Uuid) -> HashSet<String> {
        let Some(plan) = self.plans.get(&plan_id) else {
            return HashSet::new();
        };
        let Some(rank) = self.plan_order.iter().position(|slug| *slug == plan.slug) else {
            return self.feature_keys(plan_id);
        };

        self.plan_order[..=rank]
            .iter()
            .filter_map(|slug| self.plan_ids_by_slug.get(slug))
            .flat_map(|id| self.feature_keys(*id))
            .collect()
    }

    /// Lowest plan in `plan_order` whose inherited set includes the feature
    pub fn minimum_plan_for(&self, feature_key: &str) -> Option<PlanRef> {
        let canonical = self.aliases.canonical(feature_key).to_string();
        if let Some(cached) = self.minimum_plans.get(&canonical) {
            return cached;
        }

        let found = self
            .plan_order
            .iter()
            .filter_map(|slug| self.plan_by_slug(slug))
            .find(|plan| {
                self.inherited_feature_keys(plan.id)
                    .iter()
                    .any(|key| self.aliases.canonical(key) == canonical)
            })
            .map(PlanRef::from);

        self.minimum_plans.insert(canonical, found.clone());
        found
    }

    pub fn invalidate_minimum_plans(&self) {
        self.minimum_plans.clear();
    }

    pub fn minimum_plan_cache(&self) -> &MinimumPlanCache {
        &self.minimum_plans
    }

    /// Declared limit, `None` when the plan has no row for the resource
    pub fn plan_limit(&self, plan_id: Uuid, resource_key: &str) -> Option<Limit> {
        self.limits_by_plan
            .get(&plan_id)
            .and_then(|limits| limits.get(resource_key))
            .map(PlanLimit::limit)
    }

    pub fn warning_threshold(&self, plan_id: Uuid, resource_key: &str) -> Option<u8> {
        self.limits_by_plan
            .get(&plan_id)
            .and_then(|limits| limits.get(resource_key))
            .map(|l| l.warning_threshold.clamp(1, 100) as u8)
    }

    pub fn aliases(&self) -> &FeatureAliases {
        &self.aliases
    }

    pub fn graph(&self) -> &FeatureGraph {
        &self.graph
    }

    pub fn definitions(&self) -> &[FeatureDefinition] {
        &self.definitions
    }

    pub fn definition(&self, feature_key: &str) -> Option<&FeatureDefinition> {
        let canonical = self.aliases.canonical(feature_key);
        self.definitions.iter().find(|d| d.feature_key == canonical)
    }

    /// Display name, falling back to the key itself
    pub fn feature_name(&self, feature_key: &str) -> String {
        self.definition(feature_key)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| feature_key.to_string())
    }

    pub fn resource(&self, resource_key: &str) -> Option<&ResourceDefinition> {
        self.resources.get(resource_key)
    }

    /// Resources sorted for display
    pub fn resources(&self) -> Vec<(&str, &ResourceDefinition)> {
        let mut resources: Vec<(&str, &ResourceDefinition)> = self
            .resources
            .iter()
            .map(|(key, def)| (key.as_str(), def))
            .collect();
        resources.sort_by_key(|(key, def)| (def.sort_order, key.to_string()));
        resources
    }

    /// Features gating a resource; empty when the resource is always available
    pub fn gating_features(&self, resource_key: &str) -> &[String] {
        self.limit_feature_map
            .get(resource_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn fee_breakdown(
        &self,
        plan: &SubscriptionPlan,
        currency: Currency,
        additional_schools: i32,
        include_license: bool,
    ) -> FeeBreakdown {
        let license_fee_cents = if include_license {
            plan.license_fee(currency)
        } else {
            0
        };
        let maintenance_fee_cents = plan.maintenance_fee(currency);
        let additional_schools = additional_schools.max(0);
        let additional_schools_fee_cents =
            plan.per_school_maintenance_fee(currency) * i64::from(additional_schools);
        let total_maintenance_cents = maintenance_fee_cents + additional_schools_fee_cents;

        FeeBreakdown {
            currency,
            license_fee_cents,
            maintenance_fee_cents,
            additional_schools,
            additional_schools_fee_cents,
            total_maintenance_cents,
            total_cents: license_fee_cents + total_maintenance_cents,
            billing_period_days: plan.billing_period_days(),
        }
    }

    /// Renewal quote; the one-time license fee is never charged again
    pub fn renewal_fee(
        &self,
        plan: &SubscriptionPlan,
        currency: Currency,
        additional_schools: i32,
    ) -> FeeBreakdown {
        self.fee_breakdown(plan, currency, additional_schools, false)
    }
}
