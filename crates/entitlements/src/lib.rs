// Entitlements crate clippy configuration
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
#![allow(clippy::too_many_arguments)]
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! EduGate Entitlements
//!
//! Decides what a school organization may do under its subscription.
//!
//! ## Components
//!
//! - **Plan Catalog**: plans, plan features with inheritance along `plan_order`, limits, fees
//! - **Subscription Lifecycle**: trial, activation, renewal ladder sweep, payments, suspension
//! - **Feature Gate**: enabled features, aliases, dependencies, locked features
//! - **Usage Tracker**: countable, accumulator and storage limits with warnings
//! - **Invariants**: runnable consistency checks
//!
//! [`EntitlementEngine`] wires the components together over one store, cache and
//! notifier. Hot read paths (`has_feature`, `can_create`, `access_level`) never
//! return errors; failures are logged and replaced with documented defaults.

pub mod aliases;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod dependencies;
pub mod error;
pub mod features;
pub mod history;
pub mod invariants;
pub mod lifecycle;
pub mod models;
pub mod notifications;
pub mod payments;
pub mod storage_usage;
pub mod store;
pub mod types;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use uuid::Uuid;

// Catalog
pub use catalog::{FeeBreakdown, PlanCatalog, PlanRef};

// Config
pub use config::{CatalogConfig, EngineConfig, ResourceDefinition, ResourceKind};

// Error
pub use error::{EntitlementError, EntitlementResult};

// Features
pub use features::{FeatureAccess, FeatureGate, FeatureLookup, FeatureStatus};

// History
pub use history::{HistoryAction, HistoryEntry};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{
    ActivationRequest, LifecyclePolicy, LimitOverrideRequest, ReminderSummary, StatusSummary,
    SubscriptionLifecycle, TransitionSummary,
};

// Models
pub use models::{
    FeatureAddon, FeatureDefinition, LimitOverride, OrganizationSubscription, PlanFeature,
    PlanLimit, SubscriptionPlan, UsageRecord,
};

// Notifications
pub use notifications::{LogNotifier, Notification, Notifier, WebhookNotifier};

// Payments
pub use payments::{
    PaymentConfirmation, PaymentKind, PaymentOutcome, PaymentRejection, PaymentService,
};

// Storage
pub use storage_usage::{LocalDiskBackend, StorageBackend, StorageCalculator};

// Store
pub use store::{EntitlementStore, InMemoryStore, PgEntitlementStore};

// Types
pub use types::{
    AccessLevel, AccessReason, BillingPeriod, Currency, FeatureAccessLevel, Limit, ResetPeriod,
    SubscriptionStatus,
};

// Usage
pub use usage::{ResourceUsage, UsageCheck, UsageSettings, UsageSnapshot, UsageTracker};

use cache::{FeatureCache, InMemoryFeatureCache, RedisFeatureCache};

/// All entitlement components over one shared store, catalog, cache and notifier
pub struct EntitlementEngine {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<PlanCatalog>,
    lifecycle: Arc<SubscriptionLifecycle>,
    features: Arc<FeatureGate>,
    usage: UsageTracker,
    payments: PaymentService,
    invariants: InvariantChecker,
}

impl EntitlementEngine {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        catalog: Arc<PlanCatalog>,
        cache: Arc<dyn FeatureCache>,
        notifier: Arc<dyn Notifier>,
        storage: StorageCalculator,
        config: &EngineConfig,
    ) -> Self {
        let policy = LifecyclePolicy::from(config);

        let lifecycle = Arc::new(SubscriptionLifecycle::new(
            store.clone(),
            catalog.clone(),
            cache.clone(),
            notifier.clone(),
            policy.clone(),
        ));
        let features = Arc::new(FeatureGate::new(
            store.clone(),
            catalog.clone(),
            cache,
            policy,
        ));
        let usage = UsageTracker::new(
            store.clone(),
            catalog.clone(),
            features.clone(),
            storage,
            notifier.clone(),
            UsageSettings::from(config),
        );
        let payments = PaymentService::new(lifecycle.clone(), store.clone(), notifier);
        let invariants = InvariantChecker::new(store.clone(), catalog.clone());

        Self {
            store,
            catalog,
            lifecycle,
            features,
            usage,
            payments,
            invariants,
        }
    }

    /// Build the production engine: Postgres store, Redis or in-memory feature
    /// cache, webhook or log notifier, local-disk storage roots.
    pub async fn connect(pool: sqlx::PgPool, config: &EngineConfig) -> EntitlementResult<Self> {
        let store = Arc::new(PgEntitlementStore::new(pool));
        store.run_migrations().await?;

        let catalog_config = config.load_catalog().await?;
        let catalog = PlanCatalog::load(store.as_ref(), catalog_config).await?;
        tracing::info!(
            available_plans = catalog.available_plans().len(),
            features = catalog.definitions().len(),
            "Entitlement engine ready"
        );

        let cache: Arc<dyn FeatureCache> = match &config.redis_url {
            Some(url) => {
                tracing::info!("Using Redis feature cache");
                Arc::new(RedisFeatureCache::connect(url, config.feature_cache_ttl).await?)
            }
            None => {
                tracing::info!("Using in-memory feature cache");
                Arc::new(InMemoryFeatureCache::new(config.feature_cache_ttl))
            }
        };

        let notifier: Arc<dyn Notifier> = match &config.notification_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
            None => Arc::new(LogNotifier),
        };

        Ok(Self::new(
            store,
            Arc::new(catalog),
            cache,
            notifier,
            StorageCalculator::from_roots(&config.storage_roots),
            config,
        ))
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn lifecycle(&self) -> &SubscriptionLifecycle {
        &self.lifecycle
    }

    pub fn features(&self) -> &FeatureGate {
        &self.features
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn payments(&self) -> &PaymentService {
        &self.payments
    }

    pub fn invariants(&self) -> &InvariantChecker {
        &self.invariants
    }

    // ========================================================================
    // Enforcement chokepoints
    // ========================================================================

    pub async fn has_feature(&self, organization_id: Uuid, feature_key: &str) -> bool {
        self.features.has_feature(organization_id, feature_key).await
    }

    pub async fn assert_feature(
        &self,
        organization_id: Uuid,
        feature_key: &str,
    ) -> EntitlementResult<()> {
        self.features.assert_feature(organization_id, feature_key).await
    }

    pub async fn all_features_status(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<Vec<FeatureStatus>> {
        self.features.all_features_status(organization_id).await
    }

    pub async fn can_create(&self, organization_id: Uuid, resource_key: &str) -> UsageCheck {
        self.usage.can_create(organization_id, resource_key).await
    }

    pub async fn access_level(&self, organization_id: Uuid) -> AccessLevel {
        self.lifecycle.access_level(organization_id).await
    }

    pub async fn can_read(&self, organization_id: Uuid) -> bool {
        self.lifecycle.can_read(organization_id).await
    }

    pub async fn can_write(&self, organization_id: Uuid) -> bool {
        self.lifecycle.can_write(organization_id).await
    }

    pub async fn subscription_status(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<StatusSummary> {
        self.lifecycle.subscription_status(organization_id).await
    }
}
