//! Storage usage
//!
//! Organization files live under `<root>/organizations/<org_id>/` on each
//! configured backend. Usage is reported in GB and persisted as an integer
//! scaled by [`STORAGE_SCALE`], so four decimal places survive the round trip.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::EntitlementResult;

/// Multiplier applied to GB before persisting
pub const STORAGE_SCALE: f64 = 10_000.0;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// GB to the persisted integer form
pub fn gb_to_stored(gb: f64) -> i64 {
    (gb * STORAGE_SCALE).round() as i64
}

pub fn stored_to_gb(stored: i64) -> f64 {
    stored as f64 / STORAGE_SCALE
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Total bytes held for the organization
    async fn organization_bytes(&self, organization_id: Uuid) -> EntitlementResult<u64>;
}

/// Local filesystem root
#[derive(Debug, Clone)]
pub struct LocalDiskBackend {
    name: String,
    root: PathBuf,
}

impl LocalDiskBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: root.display().to_string(),
            root,
        }
    }

    pub fn organization_dir(&self, organization_id: Uuid) -> PathBuf {
        self.root
            .join("organizations")
            .join(organization_id.to_string())
    }
}

/// Sum regular file sizes below `dir` without following symlinks.
///
/// Entries removed while the walk is running are skipped.
async fn directory_size(dir: &Path) -> EntitlementResult<u64> {
    let mut total = 0u64;
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total = total.saturating_add(metadata.len());
            }
        }
    }

    Ok(total)
}

#[async_trait]
impl StorageBackend for LocalDiskBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn organization_bytes(&self, organization_id: Uuid) -> EntitlementResult<u64> {
        let dir = self.organization_dir(organization_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(0);
        }
        directory_size(&dir).await
    }
}

/// Aggregates storage across backends
#[derive(Clone, Default)]
pub struct StorageCalculator {
    backends: Vec<Arc<dyn StorageBackend>>,
}

impl StorageCalculator {
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>) -> Self {
        Self { backends }
    }

    pub fn from_roots(roots: &[PathBuf]) -> Self {
        Self::new(
            roots
                .iter()
                .map(|root| {
                    Arc::new(LocalDiskBackend::new(root.clone())) as Arc<dyn StorageBackend>
                })
                .collect(),
        )
    }

    /// Bytes across every backend. One failing backend fails the whole total;
    /// a partial sum would understate usage.
    pub async fn total_bytes(&self, organization_id: Uuid) -> EntitlementResult<u64> {
        let mut total = 0u64;
        for backend in &self.backends {
            let bytes = backend
                .organization_bytes(organization_id)
                .await
                .inspect_err(|e| {
                    tracing::warn!(
                        org_id = %organization_id,
                        backend = backend.name(),
                        error = %e,
                        "Failed to measure storage backend"
                    );
                })?;
            total = total.saturating_add(bytes);
        }
        Ok(total)
    }

    /// Usage in GB, in its persisted scaled form
    pub async fn usage_stored(&self, organization_id: Uuid) -> EntitlementResult<i64> {
        Ok(gb_to_stored(bytes_to_gb(self.total_bytes(organization_id).await?)))
    }
}
