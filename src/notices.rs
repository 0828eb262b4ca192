//! Notice board replica.
//!
//! Notices are an upsert-style collection: the server can edit or delete
//! them, so instead of appending, a sync replaces the local replica when the
//! server reports a newer `noticeLastUpdated` than the one last applied.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{
  is_current, CacheResult, CacheStorage, InFlightRegistry, LogCache, RecordSource, ResourceClass,
  StoreKey, StoreName, StoredRow, UpdatePoller, UpdateSource,
};
use crate::error::{CacheError, Result};
use crate::models::{notice_display_order, Notice};

/// Key of the "last applied" marker in the sync state store.
const NOTICE_MARKER: &str = "notice";

struct FeedInner<S, C> {
  log: LogCache<Notice, S>,
  storage: Arc<S>,
  source: Arc<C>,
  poller: Arc<UpdatePoller<C>>,
  in_flight: InFlightRegistry<(), CacheResult<Vec<Notice>>>,
}

/// Local replica of the notice board. Clones share all state.
pub struct NoticeFeed<S, C> {
  inner: Arc<FeedInner<S, C>>,
}

impl<S, C> Clone for NoticeFeed<S, C> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

fn display_sorted(mut notices: Vec<Notice>) -> Vec<Notice> {
  notices.sort_by(notice_display_order);
  notices
}

impl<S, C> NoticeFeed<S, C>
where
  S: CacheStorage,
  C: RecordSource<Notice> + UpdateSource,
{
  pub fn new(storage: Arc<S>, source: Arc<C>, poller: Arc<UpdatePoller<C>>) -> Self {
    Self {
      inner: Arc::new(FeedInner {
        log: LogCache::new(StoreName::Notices, Arc::clone(&storage)),
        storage,
        source,
        poller,
        in_flight: InFlightRegistry::new(),
      }),
    }
  }

  /// Bring the replica up to date with the server.
  ///
  /// Without `force` the cached list is served while the applied marker is
  /// not behind the server, and also when the server cannot be reached but
  /// something is cached. Concurrent syncs share one request.
  pub async fn sync(&self, force: bool) -> Result<CacheResult<Vec<Notice>>> {
    let inner = Arc::clone(&self.inner);
    self
      .inner
      .in_flight
      .run((), force, move || async move { inner.sync_now(force).await })
      .await
  }

  pub async fn get(&self, id: i64) -> Option<Notice> {
    self.inner.log.load().await;
    self.inner.log.get(id)
  }

  /// Fetch one notice from the server. A cached copy is replaced with the
  /// answer; a notice not in the replica is returned without being added,
  /// since the next sync brings the whole list. A notice the server no
  /// longer has is removed from the replica.
  pub async fn fetch_one(&self, id: i64) -> Result<Option<Notice>> {
    self.inner.log.load().await;
    match self.inner.source.fetch_one(id).await? {
      Some(notice) => {
        if self.inner.log.contains(id) {
          self.inner.log.upsert(notice.clone()).await?;
        }
        Ok(Some(notice))
      }
      None => {
        if self.inner.log.remove(id).await? {
          debug!(id, "notice gone from server, removed locally");
        }
        Ok(None)
      }
    }
  }

  /// Cached notices, pinned first, then newest first.
  pub async fn sorted(&self) -> Vec<Notice> {
    self.inner.log.load().await;
    display_sorted(self.inner.log.snapshot())
  }

  pub async fn len(&self) -> usize {
    self.inner.log.load().await;
    self.inner.log.len()
  }

  /// Drop the replica and forget the applied marker.
  pub async fn clear(&self) -> Result<()> {
    self.inner.log.clear().await?;
    self
      .inner
      .storage
      .delete(StoreName::SyncState, StoreKey::from(NOTICE_MARKER))
      .await
  }

  /// Server timestamp of the last applied sync.
  pub async fn applied_marker(&self) -> Option<i64> {
    self.inner.read_marker().await
  }
}

impl<S, C> FeedInner<S, C>
where
  S: CacheStorage,
  C: RecordSource<Notice> + UpdateSource,
{
  async fn sync_now(&self, force: bool) -> Result<CacheResult<Vec<Notice>>> {
    self.log.load().await;
    let applied = self.read_marker().await;

    let server = match self.poller.poll().await {
      Ok(updates) => Some(updates.get(ResourceClass::Notice)),
      Err(e) if force => return Err(e),
      Err(e) => {
        warn!(error = %e, "failed to poll update timestamps");
        if !self.log.is_empty() {
          return Ok(CacheResult::offline(display_sorted(self.log.snapshot())));
        }
        None
      }
    };

    if let Some(server) = server {
      if is_current(applied, server, force) {
        debug!(applied, server, "notices are current");
        return Ok(CacheResult::from_store(display_sorted(self.log.snapshot()), None));
      }
    }

    let notices = match self.source.fetch_all().await {
      Ok(notices) => notices,
      Err(e) => return self.offline_or(e, force),
    };

    let count = notices.len();
    match self.log.replace_all(notices).await {
      Ok(()) => {
        if let Some(server) = server {
          self.write_marker(server).await;
        }
      }
      // The marker stays behind, so the next sync refetches
      Err(e) => warn!(error = %e, "failed to persist notices"),
    }

    info!(count, server, "notices synced");
    Ok(CacheResult::from_network(display_sorted(self.log.snapshot())))
  }

  fn offline_or(&self, error: CacheError, force: bool) -> Result<CacheResult<Vec<Notice>>> {
    if force || self.log.is_empty() {
      return Err(error);
    }
    warn!(error = %error, "failed to fetch notices, serving cached copy");
    Ok(CacheResult::offline(display_sorted(self.log.snapshot())))
  }

  async fn read_marker(&self) -> Option<i64> {
    let row = match self
      .storage
      .get(StoreName::SyncState, StoreKey::from(NOTICE_MARKER))
      .await
    {
      Ok(row) => row?,
      Err(e) => {
        warn!(error = %e, "failed to read notice marker");
        return None;
      }
    };

    match <[u8; 8]>::try_from(row.payload.as_slice()) {
      Ok(bytes) => Some(i64::from_be_bytes(bytes)),
      Err(_) => {
        warn!(len = row.payload.len(), "ignoring malformed notice marker");
        None
      }
    }
  }

  async fn write_marker(&self, server: i64) {
    let row = StoredRow::new(NOTICE_MARKER, server.to_be_bytes().to_vec());
    if let Err(e) = self.storage.put(StoreName::SyncState, row).await {
      warn!(error = %e, "failed to persist notice marker");
    }
  }
}
