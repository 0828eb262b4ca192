//! Three-tier cache for remote binary resources (avatars).
//!
//! Resolution for a key: live handle in memory, then an outstanding fetch
//! for the same key, then a fresh record in the persistent store, then the
//! network. Successful fetches are written through to the store and the
//! handle cache before being returned. Failures are never cached.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::freshness::FreshnessPolicy;
use super::handles::{Handle, HandleCache};
use super::inflight::InFlightRegistry;
use super::storage::{CacheStorage, StoreKey, StoreName, StoredRow};
use super::traits::{CacheResult, CacheSource, ResourceFetcher};
use crate::error::Result;

/// Whether `key` names something worth caching. Inline (`data:`) and
/// process-local (`blob:`) references already are local data.
pub fn is_cacheable(key: &str) -> bool {
  !key.is_empty() && !key.starts_with("data:") && !key.starts_with("blob:")
}

struct BinaryInner<S, F> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  handles: Arc<HandleCache>,
  policy: FreshnessPolicy,
  in_flight: InFlightRegistry<String, CacheResult<Handle>>,
  /// Write-backs hold it shared, `clear` exclusively
  writes: RwLock<()>,
}

/// Binary resource cache. Cheap to clone; clones share all state.
pub struct BinaryCache<S, F> {
  inner: Arc<BinaryInner<S, F>>,
}

impl<S, F> Clone for BinaryCache<S, F> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// The avatar cache is the binary cache over the `avatars` store.
pub type AvatarCache<S, F> = BinaryCache<S, F>;

impl<S: CacheStorage, F: ResourceFetcher> BinaryCache<S, F> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<F>,
    handles: Arc<HandleCache>,
    policy: FreshnessPolicy,
  ) -> Self {
    Self {
      inner: Arc::new(BinaryInner {
        storage,
        fetcher,
        handles,
        policy,
        in_flight: InFlightRegistry::new(),
        writes: RwLock::new(()),
      }),
    }
  }

  pub fn handles(&self) -> &HandleCache {
    &self.inner.handles
  }

  /// Whether a fetch for `key` is outstanding.
  pub fn is_fetching(&self, key: &str) -> bool {
    self.inner.in_flight.contains(&key.to_string())
  }

  /// Resolve `key` to a handle; `None` for uncacheable keys and failures.
  ///
  /// Failures are logged. Any handle previously issued for `key` stays valid.
  pub async fn resolve(&self, key: &str, force: bool) -> Option<Handle> {
    match self.lookup(key, force).await {
      Ok(result) => result.map(|r| r.data),
      Err(e) => {
        warn!(key, error = %e, "failed to resolve resource");
        None
      }
    }
  }

  /// Refetch `key` from the network, reporting failure to the caller.
  pub async fn refresh(&self, key: &str) -> Result<Option<Handle>> {
    Ok(self.lookup(key, true).await?.map(|r| r.data))
  }

  /// Resolve with provenance. `Ok(None)` only for uncacheable keys.
  pub async fn lookup(&self, key: &str, force: bool) -> Result<Option<CacheResult<Handle>>> {
    if !is_cacheable(key) {
      debug!(key, "key is not cacheable");
      return Ok(None);
    }

    if !force {
      if let Some(handle) = self.inner.handles.get(key) {
        debug!(key, url = %handle.url(), "memory hit");
        return Ok(Some(CacheResult::from_memory(handle)));
      }
    }

    let inner = Arc::clone(&self.inner);
    let owned = key.to_string();
    let result = self
      .inner
      .in_flight
      .run(key.to_string(), force, move || async move {
        inner.load_or_fetch(&owned, force).await
      })
      .await?;

    Ok(Some(result))
  }

  /// Drop every handle and every persisted record. Write-backs already
  /// under way finish first; later ones land after the clear.
  pub async fn clear(&self) -> Result<()> {
    let _exclusive = self.inner.writes.write().await;
    self.inner.handles.clear();
    self.inner.storage.clear(StoreName::Avatars).await
  }
}

impl<S: CacheStorage, F: ResourceFetcher> BinaryInner<S, F> {
  async fn load_or_fetch(&self, key: &str, force: bool) -> Result<CacheResult<Handle>> {
    if !force {
      let _write = self.writes.read().await;
      match self
        .storage
        .get(StoreName::Avatars, StoreKey::from(key))
        .await
      {
        Ok(Some(row)) if self.policy.is_fresh(row.stored_at, Utc::now(), false) => {
          let handle = self.handles.set(key, row.payload);
          debug!(key, stored_at = %row.stored_at, "store hit");
          return Ok(CacheResult::from_store(handle, Some(row.stored_at)));
        }
        Ok(Some(row)) => debug!(key, stored_at = %row.stored_at, "stored record is stale"),
        Ok(None) => {}
        Err(e) => warn!(key, error = %e, "failed to read cached resource"),
      }
    }

    let bytes = self.fetcher.fetch_bytes(key).await?;

    let _write = self.writes.read().await;
    if let Err(e) = self
      .storage
      .put(StoreName::Avatars, StoredRow::new(key, bytes.clone()))
      .await
    {
      warn!(key, error = %e, "failed to persist resource");
    }

    let handle = self.handles.set(key, bytes);
    info!(key, bytes = handle.len(), source = %CacheSource::Network, "resource fetched");
    Ok(CacheResult::from_network(handle))
  }
}
