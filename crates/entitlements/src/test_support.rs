//! Fixtures shared by unit and edge-case tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::cache::InMemoryFeatureCache;
use crate::catalog::PlanCatalog;
use crate::config::{CatalogConfig, EngineConfig};
use crate::error::{EntitlementError, EntitlementResult};
use crate::models::{OrganizationSubscription, PlanFeature, PlanLimit, SubscriptionPlan};
use crate::notifications::{Notification, Notifier};
use crate::storage_usage::{StorageBackend, StorageCalculator};
use crate::store::{EntitlementStore, InMemoryStore};
use crate::types::{BillingPeriod, SubscriptionStatus};
use crate::EntitlementEngine;

const TRIAL_FEATURES: &[&str] = &[
    "students",
    "staff",
    "classes",
    "attendance",
    "timetables",
    "student_history",
    "pdf_reports",
];

const STARTER_FEATURES: &[&str] = &[
    "students",
    "staff",
    "classes",
    "attendance",
    "leave_management",
    "timetables",
    "student_history",
    "pdf_reports",
];

const PRO_FEATURES: &[&str] = &[
    "subjects",
    "teacher_subject_assignments",
    "exams",
    "exams_full",
    "grades",
    "finance",
    "fees",
    "dms",
    "letter_templates",
    "events",
    "excel_export",
    "report_templates",
];

const COMPLETE_FEATURES: &[&str] = &[
    "hostel",
    "library",
    "assets",
    "graduation",
    "certificate_verification",
    "id_cards",
    "custom_id_templates",
    "question_bank",
    "exam_paper_generator",
    "short_courses",
    "multi_currency",
    "advanced_reports",
];

const ENTERPRISE_FEATURES: &[&str] =
    &["multi_school", "api_access", "custom_branding", "public_website"];

fn plan(n: u128, slug: &str, sort_order: i32, fees_afn: (i64, i64, i64)) -> SubscriptionPlan {
    let (license, maintenance, per_school) = fees_afn;
    SubscriptionPlan {
        id: Uuid::from_u128(0x1000 + n),
        slug: slug.to_string(),
        name: format!("{}{}", slug[..1].to_uppercase(), &slug[1..]),
        description: None,
        license_fee_afn_cents: license,
        license_fee_usd_cents: license / 70,
        maintenance_fee_afn_cents: maintenance,
        maintenance_fee_usd_cents: maintenance / 70,
        per_school_maintenance_afn_cents: per_school,
        per_school_maintenance_usd_cents: per_school / 70,
        trial_days: 0,
        grace_period_days: 14,
        readonly_period_days: 60,
        billing_period: BillingPeriod::Yearly,
        custom_billing_days: None,
        max_schools: 1,
        sort_order,
        is_active: true,
        is_custom: false,
    }
}

/// trial, starter, pro, complete, enterprise, then a custom `basic` plan and an
/// inactive `legacy` plan
pub(crate) fn plans() -> Vec<SubscriptionPlan> {
    let mut trial = plan(0, "trial", 0, (0, 0, 0));
    trial.trial_days = 7;

    let mut enterprise = plan(4, "enterprise", 4, (5_000_000, 2_500_000, 0));
    enterprise.max_schools = 5;

    let mut basic = plan(5, "basic", 5, (0, 200_000, 0));
    basic.is_custom = true;

    let mut legacy = plan(6, "legacy", 6, (0, 100_000, 0));
    legacy.is_active = false;

    vec![
        trial,
        plan(1, "starter", 1, (1_000_000, 500_000, 100_000)),
        plan(2, "pro", 2, (2_000_000, 1_000_000, 200_000)),
        plan(3, "complete", 3, (3_000_000, 1_500_000, 300_000)),
        enterprise,
        basic,
        legacy,
    ]
}

fn plan_features(plans: &[SubscriptionPlan]) -> Vec<PlanFeature> {
    let keys_for = |slug: &str| -> &[&str] {
        match slug {
            "trial" => TRIAL_FEATURES,
            "starter" => STARTER_FEATURES,
            "pro" => PRO_FEATURES,
            "complete" => COMPLETE_FEATURES,
            "enterprise" => ENTERPRISE_FEATURES,
            _ => &["students", "staff"],
        }
    };

    plans
        .iter()
        .flat_map(|plan| {
            keys_for(&plan.slug).iter().map(move |key| PlanFeature {
                plan_id: plan.id,
                feature_key: key.to_string(),
                is_enabled: true,
            })
        })
        .collect()
}

fn plan_limits(plans: &[SubscriptionPlan]) -> Vec<PlanLimit> {
    let limits_for = |slug: &str| -> Vec<(&'static str, i64)> {
        match slug {
            "trial" => vec![
                ("students", 50),
                ("staff", 10),
                ("classes", 10),
                ("report_exports", 10),
                ("storage_gb", 1),
            ],
            "starter" => vec![
                ("students", 250),
                ("staff", 40),
                ("classes", 30),
                ("users", 10),
                ("report_exports", 100),
                ("storage_gb", 5),
            ],
            "pro" => vec![
                ("students", 600),
                ("staff", 100),
                ("exams_yearly", 50),
                ("storage_gb", 20),
            ],
            "complete" => vec![("students", 1200), ("staff", 250), ("storage_gb", 50)],
            "enterprise" => vec![("students", -1), ("staff", -1), ("storage_gb", -1)],
            "basic" => vec![("students", 5), ("staff", 0)],
            _ => vec![],
        }
    };

    plans
        .iter()
        .flat_map(|plan| {
            limits_for(&plan.slug)
                .into_iter()
                .map(move |(resource, value)| PlanLimit {
                    plan_id: plan.id,
                    resource_key: resource.to_string(),
                    limit_value: value,
                    warning_threshold: 80,
                })
        })
        .collect()
}

pub(crate) fn fixture_catalog() -> PlanCatalog {
    let plans = plans();
    let features = plan_features(&plans);
    let limits = plan_limits(&plans);
    PlanCatalog::new(CatalogConfig::bundled().unwrap(), plans, features, limits)
}

pub(crate) fn fixture_store() -> InMemoryStore {
    let plans = plans();
    let features = plan_features(&plans);
    let limits = plan_limits(&plans);
    InMemoryStore::with_plans(plans, features, limits)
}

pub(crate) fn plan_id(catalog: &PlanCatalog, slug: &str) -> Uuid {
    catalog.plan_by_slug(slug).unwrap().id
}

/// A current row on `plan` whose dates are consistent with `status`
pub(crate) fn subscription_on(
    organization_id: Uuid,
    plan: &SubscriptionPlan,
    status: SubscriptionStatus,
) -> OrganizationSubscription {
    let now = OffsetDateTime::now_utc();
    let mut sub = OrganizationSubscription::new_trial(organization_id, plan, now);
    sub.status = status;
    sub.started_at = Some(now - Duration::days(30));
    sub.created_at = now - Duration::days(30);

    let expires = match status {
        SubscriptionStatus::Trial => now + Duration::days(7),
        SubscriptionStatus::GracePeriod => {
            sub.grace_period_ends_at = Some(now + Duration::days(12));
            now - Duration::days(2)
        }
        SubscriptionStatus::Readonly => {
            sub.grace_period_ends_at = Some(now - Duration::days(6));
            sub.readonly_period_ends_at = Some(now + Duration::days(54));
            now - Duration::days(20)
        }
        SubscriptionStatus::Expired => {
            sub.grace_period_ends_at = Some(now - Duration::days(66));
            sub.readonly_period_ends_at = Some(now - Duration::days(6));
            now - Duration::days(80)
        }
        _ => now + Duration::days(335),
    };
    sub.expires_at = Some(expires);

    if status == SubscriptionStatus::Trial {
        sub.trial_ends_at = Some(expires);
    } else {
        sub.trial_ends_at = None;
        sub.next_maintenance_due_at = Some(expires);
        sub.last_maintenance_paid_at = sub.started_at;
        if plan.requires_license_fee() {
            sub.license_paid_at = sub.started_at;
        }
    }
    match status {
        SubscriptionStatus::Cancelled => sub.cancelled_at = Some(now),
        SubscriptionStatus::Suspended => sub.suspension_reason = Some("Manual review".to_string()),
        _ => {}
    }
    sub
}

/// Captures every notification instead of delivering it
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<(Uuid, Notification)>>,
}

impl RecordingNotifier {
    pub(crate) fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|(_, n)| n.kind()).collect()
    }

    pub(crate) fn sent(&self) -> Vec<(Uuid, Notification)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        organization_id: Uuid,
        notification: &Notification,
    ) -> EntitlementResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((organization_id, notification.clone()));
        Ok(())
    }
}

/// Storage backend reporting fixed byte totals per organization; can be switched to fail
#[derive(Default)]
pub(crate) struct FixedStorageBackend {
    bytes: Mutex<HashMap<Uuid, u64>>,
    failing: AtomicBool,
}

impl FixedStorageBackend {
    pub(crate) fn set(&self, organization_id: Uuid, bytes: u64) {
        self.bytes.lock().unwrap().insert(organization_id, bytes);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for FixedStorageBackend {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn organization_bytes(&self, organization_id: Uuid) -> EntitlementResult<u64> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EntitlementError::Storage("backend offline".to_string()));
        }
        Ok(self.bytes.lock().unwrap().get(&organization_id).copied().unwrap_or(0))
    }
}

pub(crate) struct TestEngine {
    pub engine: EntitlementEngine,
    pub store: Arc<InMemoryStore>,
    pub cache: Arc<InMemoryFeatureCache>,
    pub notifier: Arc<RecordingNotifier>,
    pub storage: Arc<FixedStorageBackend>,
}

impl TestEngine {
    pub(crate) fn plan(&self, slug: &str) -> SubscriptionPlan {
        self.engine.catalog().plan_by_slug(slug).unwrap().clone()
    }

    /// Install a current subscription on `slug` for a fresh organization
    pub(crate) async fn org_on(&self, slug: &str, status: SubscriptionStatus) -> Uuid {
        let org = Uuid::new_v4();
        let sub = subscription_on(org, &self.plan(slug), status);
        self.store.replace_subscription(None, &sub, None).await.unwrap();
        org
    }

    pub(crate) async fn install(&self, sub: &OrganizationSubscription) {
        let previous = self
            .store
            .current_subscription(sub.organization_id)
            .await
            .unwrap()
            .map(|s| s.id);
        self.store.replace_subscription(previous, sub, None).await.unwrap();
    }
}

pub(crate) fn test_engine() -> TestEngine {
    let store = Arc::new(fixture_store());
    let cache = Arc::new(InMemoryFeatureCache::new(std::time::Duration::from_secs(300)));
    let notifier = Arc::new(RecordingNotifier::default());
    let storage = Arc::new(FixedStorageBackend::default());

    let config = EngineConfig {
        default_warning_threshold: 80,
        ..EngineConfig::default()
    };

    let engine = EntitlementEngine::new(
        store.clone(),
        Arc::new(fixture_catalog()),
        cache.clone(),
        notifier.clone(),
        StorageCalculator::new(vec![storage.clone() as Arc<dyn StorageBackend>]),
        &config,
    );

    TestEngine {
        engine,
        store,
        cache,
        notifier,
        storage,
    }
}
