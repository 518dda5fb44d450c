//! TTL-cached view of the upstream model catalog.
//!
//! The free-model list changes rarely but is requested often (every client
//! settings screen). One flat snapshot behind a lock, refreshed on miss by
//! whichever caller gets the write lock first; concurrent readers may briefly
//! observe a stale snapshot, which is acceptable here.

use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::error::ProviderError;
use super::openrouter::OpenRouterAdapter;
use super::types::ModelDescriptor;

/// Default time-to-live for a catalog snapshot.
pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(600);

struct Snapshot {
    fetched_at: Instant,
    free_models: Vec<ModelDescriptor>,
}

/// Explicitly owned catalog cache with a single writer path.
///
/// Construct one per process (or per test, with a short TTL and a mock
/// adapter) rather than reaching for ambient global state.
pub struct ModelCatalog {
    adapter: OpenRouterAdapter,
    ttl: Duration,
    cached: RwLock<Option<Snapshot>>,
}

impl ModelCatalog {
    pub fn new(adapter: OpenRouterAdapter) -> Self {
        Self::with_ttl(adapter, DEFAULT_CATALOG_TTL)
    }

    pub fn with_ttl(adapter: OpenRouterAdapter, ttl: Duration) -> Self {
        Self {
            adapter,
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// The free subset of the catalog, served from cache while fresh.
    pub async fn free_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        {
            let guard = self.cached.read().await;
            if let Some(snapshot) = guard.as_ref() {
                if snapshot.fetched_at.elapsed() < self.ttl {
                    return Ok(snapshot.free_models.clone());
                }
            }
        }

        let mut guard = self.cached.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(snapshot) = guard.as_ref() {
            if snapshot.fetched_at.elapsed() < self.ttl {
                return Ok(snapshot.free_models.clone());
            }
        }

        let free_models: Vec<ModelDescriptor> = self
            .adapter
            .list_models()
            .await?
            .into_iter()
            .filter(ModelDescriptor::is_free)
            .collect();

        *guard = Some(Snapshot {
            fetched_at: Instant::now(),
            free_models: free_models.clone(),
        });

        Ok(free_models)
    }

    /// Drop the snapshot so the next read refetches.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
