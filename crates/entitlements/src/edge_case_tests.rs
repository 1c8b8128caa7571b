// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Entitlement Engine
//!
//! Tests boundary conditions across components:
//! - Access levels without a subscription and across the renewal ladder
//! - Feature aliases, dependencies and plan inheritance
//! - Lifecycle sweep idempotence
//! - Limit boundaries and storage bookkeeping

#[cfg(test)]
mod access_tests {
    use crate::test_support::{subscription_on, test_engine};
    use crate::types::{AccessLevel, SubscriptionStatus};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    // =========================================================================
    // No subscription: every feature denied, access level none
    // =========================================================================
    #[tokio::test]
    async fn test_unsubscribed_org_has_nothing() {
        let t = test_engine();
        let org = Uuid::new_v4();

        for definition in t.engine.catalog().definitions() {
            assert!(
                !t.engine.has_feature(org, &definition.feature_key).await,
                "{} should be denied without a subscription",
                definition.feature_key
            );
        }
        assert_eq!(t.engine.access_level(org).await, AccessLevel::None);
        assert!(!t.engine.can_read(org).await);
        assert!(!t.engine.can_write(org).await);
    }

    // =========================================================================
    // Expired 40 days ago with 14 grace + 60 readonly days: readonly
    // =========================================================================
    #[tokio::test]
    async fn test_forty_days_past_expiry_is_readonly() {
        let t = test_engine();
        let org = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let plan = t.plan("pro");
        assert_eq!(plan.grace_period_days, 14);
        assert_eq!(plan.readonly_period_days, 60);

        let mut sub = subscription_on(org, &plan, SubscriptionStatus::Active);
        sub.expires_at = Some(now - Duration::days(40));
        sub.next_maintenance_due_at = Some(now + Duration::days(30));
        t.install(&sub).await;

        assert_eq!(t.engine.access_level(org).await, AccessLevel::Readonly);
        assert!(!t.engine.can_write(org).await);
        assert!(t.engine.can_read(org).await);
    }

    // =========================================================================
    // Day 13 is still grace, day 75 is past readonly
    // =========================================================================
    #[tokio::test]
    async fn test_window_edges_by_time_alone() {
        let t = test_engine();
        let now = OffsetDateTime::now_utc();

        let grace_org = Uuid::new_v4();
        let mut grace = subscription_on(grace_org, &t.plan("pro"), SubscriptionStatus::Active);
        grace.expires_at = Some(now - Duration::days(13));
        grace.next_maintenance_due_at = Some(now + Duration::days(30));
        t.install(&grace).await;
        assert_eq!(t.engine.access_level(grace_org).await, AccessLevel::Grace);
        assert!(t.engine.can_write(grace_org).await);

        let late_org = Uuid::new_v4();
        let mut late = subscription_on(late_org, &t.plan("pro"), SubscriptionStatus::Active);
        late.expires_at = Some(now - Duration::days(75));
        late.next_maintenance_due_at = late.expires_at;
        t.install(&late).await;
        assert!(!t.engine.can_write(late_org).await);
    }

    // =========================================================================
    // Unpaid license past its grace window blocks an otherwise active row
    // =========================================================================
    #[tokio::test]
    async fn test_unpaid_license_blocks() {
        let t = test_engine();
        let org = Uuid::new_v4();
        let mut sub = subscription_on(org, &t.plan("starter"), SubscriptionStatus::Active);
        sub.license_paid_at = None;
        t.install(&sub).await;

        assert_eq!(t.engine.access_level(org).await, AccessLevel::Blocked);
        assert!(!t.engine.can_read(org).await);

        let status = t.engine.lifecycle().subscription_status(org).await.unwrap();
        assert!(status.license_fee_pending);
    }
}

#[cfg(test)]
mod feature_tests {
    use std::sync::Arc;

    use crate::cache::InMemoryFeatureCache;
    use crate::catalog::PlanCatalog;
    use crate::config::{CatalogConfig, EngineConfig};
    use crate::aliases::FeatureAliases;
    use crate::dependencies::FeatureGraph;
    use crate::models::{FeatureDefinition, PlanFeature};
    use crate::storage_usage::StorageCalculator;
    use crate::store::{EntitlementStore, InMemoryStore};
    use crate::test_support::{plans, test_engine, RecordingNotifier};
    use crate::types::{AccessReason, SubscriptionStatus};
    use crate::EntitlementEngine;
    use std::collections::HashSet;
    use uuid::Uuid;

    // =========================================================================
    // Every alias and its canonical key report the same canonical feature_key
    // =========================================================================
    #[tokio::test]
    async fn test_all_aliases_resolve_identically() {
        let t = test_engine();
        let org = t.org_on("complete", SubscriptionStatus::Active).await;
        let gate = t.engine.features();

        for (alias, canonical) in [("timetable", "timetables"), ("reports", "pdf_reports")] {
            let via_alias = gate.feature_access_status(org, alias).await;
            let direct = gate.feature_access_status(org, canonical).await;
            assert_eq!(via_alias.feature_key, canonical);
            assert_eq!(via_alias, direct);
        }
    }

    // =========================================================================
    // Disabling `reports` removes the canonical `pdf_reports` granted by plan
    // =========================================================================
    #[tokio::test]
    async fn test_alias_disable_beats_plan_grant() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::Active).await;

        t.engine
            .lifecycle()
            .disable_feature(org, "reports", None)
            .await
            .unwrap();

        assert!(!t.engine.has_feature(org, "reports").await);
        assert!(!t.engine.has_feature(org, "pdf_reports").await);

        let excel = t.engine.features().feature_access_status(org, "excel_export").await;
        assert_eq!(excel.reason, Some(AccessReason::DependencyMissing));
        assert_eq!(excel.missing_dependencies, vec!["pdf_reports".to_string()]);
    }

    // =========================================================================
    // Transitive prerequisites are reported through parents
    // =========================================================================
    #[tokio::test]
    async fn test_transitive_dependency_missing() {
        let t = test_engine();
        let org = t.org_on("pro", SubscriptionStatus::Active).await;

        t.engine
            .lifecycle()
            .disable_feature(org, "classes", None)
            .await
            .unwrap();

        let grades = t.engine.features().feature_access_status(org, "grades").await;
        assert!(!grades.allowed);
        assert!(grades.missing_dependencies.contains(&"classes".to_string()));
    }

    fn def(key: &str, deps: &[&str]) -> FeatureDefinition {
        FeatureDefinition {
            feature_key: key.to_string(),
            name: key.to_string(),
            description: None,
            category: "core".to_string(),
            is_addon: false,
            addon_price_yearly_afn_cents: 0,
            addon_price_yearly_usd_cents: 0,
            sort_order: 0,
            is_active: true,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            parent: None,
        }
    }

    // =========================================================================
    // A cyclic prerequisite graph still terminates
    // =========================================================================
    #[test]
    fn test_cyclic_graph_terminates() {
        let graph = FeatureGraph::from_definitions(
            &[def("a", &["b"]), def("b", &["c"]), def("c", &["a", "d"])],
            &FeatureAliases::default(),
        );
        let enabled: HashSet<String> = ["a".to_string()].into();

        assert_eq!(graph.missing_dependencies("a", &enabled), vec!["b", "c", "d"]);
    }

    // =========================================================================
    // premium inherits basic's feature through plan_order alone
    // =========================================================================
    #[tokio::test]
    async fn test_premium_inherits_from_basic() {
        let config = CatalogConfig::from_json(
            r#"{
                "plan_order": ["basic", "premium"],
                "features": [
                    {"feature_key": "x", "name": "Feature X", "category": "core"},
                    {"feature_key": "y", "name": "Feature Y", "category": "core"}
                ],
                "resources": {}
            }"#,
        )
        .unwrap();

        let mut basic = plans()[1].clone();
        basic.slug = "basic".to_string();
        let mut premium = plans()[2].clone();
        premium.slug = "premium".to_string();

        let features = vec![
            PlanFeature {
                plan_id: basic.id,
                feature_key: "x".to_string(),
                is_enabled: true,
            },
            PlanFeature {
                plan_id: premium.id,
                feature_key: "y".to_string(),
                is_enabled: true,
            },
        ];
        let plan_list = vec![basic.clone(), premium.clone()];
        let store = Arc::new(InMemoryStore::with_plans(
            plan_list.clone(),
            features.clone(),
            Vec::new(),
        ));
        let catalog = PlanCatalog::new(config, plan_list, features, Vec::new());

        let engine = EntitlementEngine::new(
            store.clone(),
            Arc::new(catalog),
            Arc::new(InMemoryFeatureCache::new(std::time::Duration::from_secs(60))),
            Arc::new(RecordingNotifier::default()),
            StorageCalculator::default(),
            &EngineConfig::default(),
        );

        let org = Uuid::new_v4();
        let sub = crate::test_support::subscription_on(org, &premium, SubscriptionStatus::Active);
        store.replace_subscription(None, &sub, None).await.unwrap();

        let enabled = engine.features().enabled_features(org).await.unwrap();
        assert!(enabled.contains(&"x".to_string()));
        assert!(enabled.contains(&"y".to_string()));
        assert_eq!(engine.catalog().minimum_plan_for("x").unwrap().slug, "basic");
        assert_eq!(engine.catalog().minimum_plan_for("y").unwrap().slug, "premium");
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use crate::store::EntitlementStore;
    use crate::test_support::{subscription_on, test_engine};
    use crate::types::SubscriptionStatus;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    // =========================================================================
    // Running the sweep twice with the same clock changes nothing the second time
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let t = test_engine();
        let now = OffsetDateTime::now_utc();

        let mut orgs = Vec::new();
        for days_past in [1, 20, 90] {
            let org = Uuid::new_v4();
            let mut sub = subscription_on(org, &t.plan("pro"), SubscriptionStatus::Active);
            sub.expires_at = Some(now - Duration::days(days_past));
            t.install(&sub).await;
            orgs.push(org);
        }

        let first = t.engine.lifecycle().process_status_transitions(now).await.unwrap();
        assert_eq!(first.to_grace_period, 3);

        let mut history_counts = Vec::new();
        let mut statuses = Vec::new();
        for org in &orgs {
            history_counts.push(t.store.history(*org).await.unwrap().len());
            statuses.push(t.store.current_subscription(*org).await.unwrap().unwrap().status);
        }

        let second = t.engine.lifecycle().process_status_transitions(now).await.unwrap();
        assert_eq!(second.total(), 0);

        for (i, org) in orgs.iter().enumerate() {
            assert_eq!(t.store.history(*org).await.unwrap().len(), history_counts[i]);
            assert_eq!(
                t.store.current_subscription(*org).await.unwrap().unwrap().status,
                statuses[i]
            );
        }
    }

    // =========================================================================
    // Concurrent sweeps never move a row twice
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_sweeps_transition_once() {
        let t = test_engine();
        let now = OffsetDateTime::now_utc();
        let org = Uuid::new_v4();
        let mut sub = subscription_on(org, &t.plan("starter"), SubscriptionStatus::Active);
        sub.expires_at = Some(now - Duration::days(1));
        t.install(&sub).await;

        let lifecycle = t.engine.lifecycle();
        let (a, b) = tokio::join!(
            lifecycle.process_status_transitions(now),
            lifecycle.process_status_transitions(now)
        );
        assert_eq!(a.unwrap().to_grace_period + b.unwrap().to_grace_period, 1);
        assert_eq!(
            t.notifier
                .kinds()
                .iter()
                .filter(|k| **k == "grace_period_started")
                .count(),
            1
        );
    }
}

#[cfg(test)]
mod usage_tests {
    use crate::lifecycle::LimitOverrideRequest;
    use crate::storage_usage::{gb_to_stored, stored_to_gb};
    use crate::test_support::test_engine;
    use crate::types::{Limit, SubscriptionStatus};

    async fn with_limit(limit: u64, current: i64) -> bool {
        let t = test_engine();
        let org = t.org_on("starter", SubscriptionStatus::Active).await;
        t.engine
            .lifecycle()
            .add_limit_override(
                org,
                LimitOverrideRequest {
                    resource_key: "students".to_string(),
                    limit: Limit::Value(limit),
                    reason: None,
                    granted_by: None,
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        t.store.set_resource_count(org, "students", current).await;
        t.engine.can_create(org, "students").await.allowed
    }

    // =========================================================================
    // limit - 1 allowed, limit blocked, for small and large limits
    // =========================================================================
    #[tokio::test]
    async fn test_limit_boundaries() {
        for limit in [1u64, 1_000_000] {
            let below = i64::try_from(limit - 1).unwrap();
            let at = i64::try_from(limit).unwrap();
            assert!(with_limit(limit, below).await, "limit {} at {}", limit, below);
            assert!(!with_limit(limit, at).await, "limit {} at {}", limit, at);
        }
    }

    // =========================================================================
    // Basic plan with five students: blocked with nothing remaining
    // =========================================================================
    #[tokio::test]
    async fn test_basic_plan_full() {
        let t = test_engine();
        let org = t.org_on("basic", SubscriptionStatus::Active).await;
        t.store.set_resource_count(org, "students", 5).await;

        let check = t.engine.can_create(org, "students").await;
        assert!(!check.allowed);
        assert_eq!(check.current, 5.0);
        assert_eq!(check.limit, Limit::Value(5));
        assert_eq!(check.remaining, Some(0.0));
    }

    // =========================================================================
    // A zero limit reads as "not available", not as a reached limit
    // =========================================================================
    #[tokio::test]
    async fn test_zero_limit_is_unavailable() {
        let t = test_engine();
        let org = t.org_on("basic", SubscriptionStatus::Active).await;

        let check = t.engine.can_create(org, "staff").await;
        assert!(!check.allowed);
        assert_eq!(check.limit, Limit::Disabled);
        assert_eq!(
            check.message.as_deref(),
            Some("This feature is not available on your current plan.")
        );
    }

    // =========================================================================
    // Scaled storage keeps four decimal places
    // =========================================================================
    #[test]
    fn test_storage_round_trip() {
        for gb in [0.0001, 0.5, 1.2345, 4.9999, 1234.5678] {
            let back = stored_to_gb(gb_to_stored(gb));
            assert!((back - gb).abs() < 0.00005, "{} came back as {}", gb, back);
        }
    }
}
