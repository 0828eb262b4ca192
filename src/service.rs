//! Process-wide cache state.

use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{
  AvatarCache, BlobRegistry, CacheStorage, HandleCache, LogCache, RecordSource, ResourceFetcher,
  StoreName, UpdatePoller, UpdateSource,
};
use crate::config::CacheSettings;
use crate::error::Result;
use crate::models::{Message, Notice};
use crate::notices::NoticeFeed;

/// Owns every cache tier for the lifetime of the process.
///
/// `C` is the server client; one instance serves binary fetches, update
/// polls and notice requests.
pub struct CacheService<S, C> {
  handles: Arc<HandleCache>,
  avatars: AvatarCache<S, C>,
  chat: LogCache<Message, S>,
  notices: NoticeFeed<S, C>,
}

impl<S, C> CacheService<S, C>
where
  S: CacheStorage,
  C: ResourceFetcher + UpdateSource + RecordSource<Notice>,
{
  pub fn new(storage: Arc<S>, client: Arc<C>, settings: &CacheSettings) -> Self {
    let handles = Arc::new(HandleCache::new(BlobRegistry::new()));
    let poller = Arc::new(UpdatePoller::new(Arc::clone(&client), settings.poll_window()));

    Self {
      avatars: AvatarCache::new(
        Arc::clone(&storage),
        Arc::clone(&client),
        Arc::clone(&handles),
        settings.avatar_policy(),
      ),
      chat: LogCache::bounded(
        StoreName::Messages,
        Arc::clone(&storage),
        settings.chat_capacity(),
      ),
      notices: NoticeFeed::new(storage, client, poller),
      handles,
    }
  }

  pub fn avatars(&self) -> &AvatarCache<S, C> {
    &self.avatars
  }

  /// Chat history. Call `load` before reading it.
  pub fn chat(&self) -> &LogCache<Message, S> {
    &self.chat
  }

  pub fn notices(&self) -> &NoticeFeed<S, C> {
    &self.notices
  }

  pub fn handles(&self) -> &HandleCache {
    &self.handles
  }

  /// Revoke every handle and empty every store. All tiers are attempted;
  /// the first failure is returned.
  pub async fn purge(&self) -> Result<()> {
    let results = [
      self.avatars.clear().await,
      self.chat.clear().await,
      self.notices.clear().await,
    ];

    let mut first_error = None;
    for result in results {
      if let Err(e) = result {
        warn!(error = %e, "failed to purge cache tier");
        first_error.get_or_insert(e);
      }
    }

    match first_error {
      Some(e) => Err(e),
      None => {
        info!("cache purged");
        Ok(())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage, UpdateTimestamps};
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Default)]
  struct FakeClient {
    byte_fetches: AtomicU32,
  }

  impl ResourceFetcher for FakeClient {
    async fn fetch_bytes(&self, key: &str) -> Result<Vec<u8>> {
      self.byte_fetches.fetch_add(1, Ordering::SeqCst);
      Ok(key.as_bytes().to_vec())
    }
  }

  impl UpdateSource for FakeClient {
    async fn fetch_updates(&self) -> Result<UpdateTimestamps> {
      Ok(UpdateTimestamps {
        notice_last_updated: 10,
        ..Default::default()
      })
    }
  }

  impl RecordSource<Notice> for FakeClient {
    async fn fetch_all(&self) -> Result<Vec<Notice>> {
      Ok(vec![Notice {
        id: 1,
        title: "welcome".into(),
        content: "hello".into(),
        pinned: true,
        author_username: "admin".into(),
        created_at: 1,
        updated_at: 1,
      }])
    }

    async fn fetch_one(&self, _id: i64) -> Result<Option<Notice>> {
      Ok(None)
    }
  }

  fn message(id: i64) -> Message {
    Message {
      id,
      sender: "yuki".into(),
      content: format!("message {}", id),
      timestamp: id * 1000,
    }
  }

  #[tokio::test]
  async fn test_chat_capacity_comes_from_settings() {
    let settings = CacheSettings {
      chat_soft_cap: 5,
      chat_overflow: 2,
      ..Default::default()
    };
    let storage = Arc::new(SqliteStorage::in_memory());
    let service = CacheService::new(storage.clone(), Arc::new(FakeClient::default()), &settings);

    service.chat().load().await;
    for id in 1..=8 {
      service.chat().append(message(id)).await.unwrap();
    }

    let ids: Vec<i64> = service.chat().snapshot().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![4, 5, 6, 7, 8]);
    assert_eq!(storage.count(StoreName::Messages).await.unwrap(), 5);
  }

  #[tokio::test]
  async fn test_purge_empties_every_tier() {
    let storage = Arc::new(SqliteStorage::in_memory());
    let client = Arc::new(FakeClient::default());
    let service = CacheService::new(storage.clone(), client.clone(), &CacheSettings::default());

    let avatar = service.avatars().resolve("/avatars/a.png", false).await.unwrap();
    service.chat().load().await;
    service.chat().append(message(1)).await.unwrap();
    let synced = service.notices().sync(false).await.unwrap();
    assert_eq!(synced.source, CacheSource::Network);

    service.purge().await.unwrap();

    assert!(avatar.is_revoked());
    assert!(service.handles().is_empty());
    assert!(service.chat().is_empty());
    assert!(service.notices().sorted().await.is_empty());
    for store in StoreName::ALL {
      assert_eq!(storage.count(store).await.unwrap(), 0, "{} not empty", store);
    }

    // Purged avatars are fetched again
    service.avatars().resolve("/avatars/a.png", false).await.unwrap();
    assert_eq!(client.byte_fetches.load(Ordering::SeqCst), 2);
  }
}
