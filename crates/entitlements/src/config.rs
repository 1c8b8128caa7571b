//! Engine configuration and catalog document
//!
//! Runtime knobs come from the environment (`EngineConfig::from_env`); the feature
//! catalog (definitions, dependency graph, aliases, plan order, resource classes)
//! is a JSON document bundled with the crate and overridable by path.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EntitlementError, EntitlementResult};
use crate::models::FeatureDefinition;
use crate::types::ResetPeriod;

const DEFAULT_CATALOG: &str = include_str!("../catalog/default.json");

const DEFAULT_FEATURE_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_USAGE_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_WARNING_THRESHOLD: u8 = 80;
const DEFAULT_STORAGE_ROOTS: &str = "storage/app/private,storage/app/public";
const DEFAULT_MAINTENANCE_GRACE_DAYS: i64 = 7;
const DEFAULT_LICENSE_GRACE_DAYS: i64 = 14;
const DEFAULT_TRIAL_PLAN_SLUG: &str = "trial";

/// Runtime configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    /// Redis-backed feature cache when set, in-memory otherwise
    pub redis_url: Option<String>,
    pub catalog_path: Option<PathBuf>,
    pub feature_cache_ttl: Duration,
    pub usage_cache_ttl: Duration,
    pub default_warning_threshold: u8,
    pub storage_roots: Vec<PathBuf>,
    /// Webhook notifier when set, log notifier otherwise
    pub notification_webhook_url: Option<String>,
    pub maintenance_grace_days: i64,
    pub license_grace_days: i64,
    pub trial_plan_slug: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            catalog_path: None,
            feature_cache_ttl: Duration::from_secs(DEFAULT_FEATURE_CACHE_TTL_SECS),
            usage_cache_ttl: Duration::from_secs(DEFAULT_USAGE_CACHE_TTL_SECS),
            default_warning_threshold: DEFAULT_WARNING_THRESHOLD,
            storage_roots: parse_roots(DEFAULT_STORAGE_ROOTS),
            notification_webhook_url: None,
            maintenance_grace_days: DEFAULT_MAINTENANCE_GRACE_DAYS,
            license_grace_days: DEFAULT_LICENSE_GRACE_DAYS,
            trial_plan_slug: DEFAULT_TRIAL_PLAN_SLUG.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> EntitlementResult<Self> {
        let mut config = Self::default();

        config.database_url = non_empty_var("DATABASE_URL");
        config.redis_url = non_empty_var("REDIS_URL");
        config.catalog_path = non_empty_var("ENTITLEMENT_CATALOG_PATH").map(PathBuf::from);
        config.notification_webhook_url = non_empty_var("NOTIFICATION_WEBHOOK_URL");

        if let Some(secs) = parse_var::<u64>("FEATURE_CACHE_TTL_SECS")? {
            config.feature_cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("USAGE_CACHE_TTL_SECS")? {
            config.usage_cache_ttl = Duration::from_secs(secs);
        }
        if let Some(threshold) = parse_var::<u8>("DEFAULT_WARNING_THRESHOLD")? {
            if threshold == 0 || threshold > 100 {
                return Err(EntitlementError::Config(format!(
                    "DEFAULT_WARNING_THRESHOLD must be between 1 and 100, got {}",
                    threshold
                )));
            }
            config.default_warning_threshold = threshold;
        }
        if let Some(roots) = non_empty_var("STORAGE_ROOTS") {
            config.storage_roots = parse_roots(&roots);
        }
        if let Some(days) = parse_var::<i64>("MAINTENANCE_GRACE_DAYS")? {
            config.maintenance_grace_days = days;
        }
        if let Some(days) = parse_var::<i64>("LICENSE_GRACE_DAYS")? {
            config.license_grace_days = days;
        }
        if let Some(slug) = non_empty_var("TRIAL_PLAN_SLUG") {
            config.trial_plan_slug = slug;
        }

        Ok(config)
    }

    /// Catalog from `catalog_path`, or the bundled default
    pub async fn load_catalog(&self) -> EntitlementResult<CatalogConfig> {
        match &self.catalog_path {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    EntitlementError::Config(format!(
                        "failed to read catalog {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                CatalogConfig::from_json(&raw)
            }
            None => CatalogConfig::bundled(),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str) -> EntitlementResult<Option<T>> {
    match non_empty_var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| {
                EntitlementError::Config(format!("{} has an invalid value: {}", key, raw))
            }),
        None => Ok(None),
    }
}

fn parse_roots(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// How a resource's usage is measured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceKind {
    /// Counted from an owning table on demand
    Countable {
        table: String,
        #[serde(default)]
        active_column: Option<String>,
        #[serde(default = "default_soft_delete")]
        soft_delete: bool,
    },
    /// Running total, optionally reset each period
    Accumulator {
        #[serde(default)]
        reset: Option<ResetPeriod>,
    },
    /// Gigabytes summed across storage backends
    Storage,
}

fn default_soft_delete() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(flatten)]
    pub kind: ResourceKind,
    #[serde(default)]
    pub sort_order: i32,
}

fn default_unit() -> String {
    "count".to_string()
}

/// Static catalog document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Plans in ascending rank; each inherits every feature of those before it
    pub plan_order: Vec<String>,
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    pub features: Vec<FeatureDefinition>,
    /// Resource key to the features that gate it; empty means ungated
    #[serde(default)]
    pub limit_feature_map: HashMap<String, Vec<String>>,
    pub resources: HashMap<String, ResourceDefinition>,
}

impl CatalogConfig {
    pub fn from_json(raw: &str) -> EntitlementResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| EntitlementError::Config(format!("invalid catalog document: {}", e)))
    }

    pub fn bundled() -> EntitlementResult<Self> {
        Self::from_json(DEFAULT_CATALOG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_bundled_catalog_parses() {
        let catalog = CatalogConfig::bundled().unwrap();
        assert_eq!(
            catalog.plan_order,
            vec!["starter", "pro", "complete", "enterprise"]
        );
        assert_eq!(catalog.aliases.get("reports").map(String::as_str), Some("pdf_reports"));
        assert_eq!(catalog.aliases.get("timetable").map(String::as_str), Some("timetables"));
        assert!(matches!(
            catalog.resources.get("report_exports").map(|r| &r.kind),
            Some(ResourceKind::Accumulator { reset: Some(ResetPeriod::Monthly) })
        ));
        assert!(matches!(
            catalog.resources.get("storage_gb").map(|r| &r.kind),
            Some(ResourceKind::Storage)
        ));
    }

    #[test]
    fn test_bundled_catalog_features_are_unique() {
        let catalog = CatalogConfig::bundled().unwrap();
        let mut keys: Vec<&str> = catalog.features.iter().map(|f| f.feature_key.as_str()).collect();
        let total = keys.len();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), total);
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() {
        std::env::set_var("FEATURE_CACHE_TTL_SECS", "60");
        std::env::set_var("STORAGE_ROOTS", "/srv/a, /srv/b");
        std::env::set_var("TRIAL_PLAN_SLUG", "free-trial");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.feature_cache_ttl, Duration::from_secs(60));
        assert_eq!(
            config.storage_roots,
            vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]
        );
        assert_eq!(config.trial_plan_slug, "free-trial");

        std::env::remove_var("FEATURE_CACHE_TTL_SECS");
        std::env::remove_var("STORAGE_ROOTS");
        std::env::remove_var("TRIAL_PLAN_SLUG");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_threshold() {
        std::env::set_var("DEFAULT_WARNING_THRESHOLD", "150");
        let result = EngineConfig::from_env();
        std::env::remove_var("DEFAULT_WARNING_THRESHOLD");
        assert!(matches!(result, Err(EntitlementError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.default_warning_threshold, 80);
        assert_eq!(config.maintenance_grace_days, 7);
        assert_eq!(config.license_grace_days, 14);
        assert_eq!(config.storage_roots.len(), 2);
    }
}
