//! Enabled-feature cache
//!
//! Resolved feature sets are cached per organization for a short TTL and
//! invalidated whenever the subscription or its addons change.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EntitlementResult;

/// Maximum organizations held by the in-memory cache
const MAX_CACHE_ENTRIES: usize = 10_000;

pub fn feature_cache_key(organization_id: Uuid) -> String {
    format!("entitlements:enabled-features:v1:{}", organization_id)
}

#[async_trait]
pub trait FeatureCache: Send + Sync {
    async fn get(&self, organization_id: Uuid) -> EntitlementResult<Option<Vec<String>>>;

    async fn put(&self, organization_id: Uuid, features: &[String]) -> EntitlementResult<()>;

    async fn invalidate(&self, organization_id: Uuid) -> EntitlementResult<()>;
}

#[derive(Debug, Clone)]
struct CachedFeatures {
    features: Vec<String>,
    cached_at: Instant,
}

/// Process-local cache with TTL and bounded size
#[derive(Clone)]
pub struct InMemoryFeatureCache {
    entries: Arc<RwLock<HashMap<Uuid, CachedFeatures>>>,
    ttl: Duration,
    max_entries: usize,
}

impl InMemoryFeatureCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, MAX_CACHE_ENTRIES)
    }

    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl FeatureCache for InMemoryFeatureCache {
    async fn get(&self, organization_id: Uuid) -> EntitlementResult<Option<Vec<String>>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&organization_id)
            .filter(|cached| cached.cached_at.elapsed() < self.ttl)
            .map(|cached| cached.features.clone()))
    }

    async fn put(&self, organization_id: Uuid, features: &[String]) -> EntitlementResult<()> {
        let mut entries = self.entries.write().await;

        if entries.len() >= self.max_entries && !entries.contains_key(&organization_id) {
            entries.retain(|_, cached| cached.cached_at.elapsed() < self.ttl);

            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, cached)| cached.cached_at)
                    .map(|(org_id, _)| *org_id);
                if let Some(org_id) = oldest {
                    entries.remove(&org_id);
                }
            }
        }

        entries.insert(
            organization_id,
            CachedFeatures {
                features: features.to_vec(),
                cached_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn invalidate(&self, organization_id: Uuid) -> EntitlementResult<()> {
        self.entries.write().await.remove(&organization_id);
        Ok(())
    }
}

/// Shared cache across api and worker processes
#[derive(Clone)]
pub struct RedisFeatureCache {
    conn: redis::aio::ConnectionManager,
    ttl: Duration,
}

impl RedisFeatureCache {
    pub async fn connect(url: &str, ttl: Duration) -> EntitlementResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        tracing::info!("Connected feature cache to Redis");
        Ok(Self { conn, ttl })
    }
}

#[async_trait]
impl FeatureCache for RedisFeatureCache {
    async fn get(&self, organization_id: Uuid) -> EntitlementResult<Option<Vec<String>>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(feature_cache_key(organization_id))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, organization_id: Uuid, features: &[String]) -> EntitlementResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(features)?;
        let _: () = redis::cmd("SET")
            .arg(feature_cache_key(organization_id))
            .arg(payload)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, organization_id: Uuid) -> EntitlementResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(feature_cache_key(organization_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
