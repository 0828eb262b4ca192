//! Session-local handles for decoded binary payloads.
//!
//! A `Handle` is the in-process reference a renderer uses instead of the raw
//! bytes, much like an object URL. Handles are issued by a `BlobRegistry` and
//! stay resolvable until revoked. The `HandleCache` owns the handles it
//! creates and is the only place that revokes them.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

struct HandleInner {
  url: String,
  digest: String,
  bytes: Arc<[u8]>,
  revoked: AtomicBool,
}

/// Renderable reference to an in-memory payload. Clones refer to the same
/// handle; equality is identity, not content.
#[derive(Clone)]
pub struct Handle {
  inner: Arc<HandleInner>,
}

impl Handle {
  /// Process-local URL, e.g. `blob:shigure/12`.
  pub fn url(&self) -> &str {
    &self.inner.url
  }

  /// Hex SHA-256 of the payload.
  pub fn digest(&self) -> &str {
    &self.inner.digest
  }

  pub fn bytes(&self) -> &[u8] {
    &self.inner.bytes
  }

  pub fn len(&self) -> usize {
    self.inner.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.bytes.is_empty()
  }

  pub fn is_revoked(&self) -> bool {
    self.inner.revoked.load(Ordering::SeqCst)
  }
}

impl PartialEq for Handle {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Handle")
      .field("url", &self.inner.url)
      .field("len", &self.inner.bytes.len())
      .field("revoked", &self.is_revoked())
      .finish()
  }
}

/// Hex SHA-256 digest of a payload.
pub fn content_digest(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

#[derive(Default)]
struct RegistryInner {
  next_id: AtomicU64,
  live: Mutex<HashMap<String, Arc<[u8]>>>,
}

/// Table of live handle URLs.
#[derive(Clone, Default)]
pub struct BlobRegistry {
  inner: Arc<RegistryInner>,
}

impl BlobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn live(&self) -> MutexGuard<'_, HashMap<String, Arc<[u8]>>> {
    self
      .inner
      .live
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Allocate a new handle for `bytes`.
  pub fn create(&self, bytes: Vec<u8>) -> Handle {
    let digest = content_digest(&bytes);
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let url = format!("blob:shigure/{}", id);
    let bytes: Arc<[u8]> = bytes.into();

    self.live().insert(url.clone(), bytes.clone());

    Handle {
      inner: Arc::new(HandleInner {
        url,
        digest,
        bytes,
        revoked: AtomicBool::new(false),
      }),
    }
  }

  /// Release a handle. Returns `false` and does nothing if it was already
  /// revoked.
  pub fn revoke(&self, handle: &Handle) -> bool {
    if handle.inner.revoked.swap(true, Ordering::SeqCst) {
      warn!(url = %handle.url(), "refusing to revoke handle twice");
      return false;
    }
    self.live().remove(handle.url());
    true
  }

  /// Resolve a handle URL to its payload while it is live.
  pub fn lookup(&self, url: &str) -> Option<Arc<[u8]>> {
    self.live().get(url).cloned()
  }

  pub fn live_count(&self) -> usize {
    self.live().len()
  }
}

/// Memoizes "bytes already turned into a handle this session", one live
/// handle per key. No TTL: entries change only through `set`, `remove` or
/// `clear`, and all of them are revoked when the cache is dropped.
pub struct HandleCache {
  registry: BlobRegistry,
  entries: Mutex<HashMap<String, Handle>>,
}

impl HandleCache {
  pub fn new(registry: BlobRegistry) -> Self {
    Self {
      registry,
      entries: Mutex::new(HashMap::new()),
    }
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, Handle>> {
    self
      .entries
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn registry(&self) -> &BlobRegistry {
    &self.registry
  }

  pub fn get(&self, key: &str) -> Option<Handle> {
    self.entries().get(key).cloned()
  }

  /// Install a handle for `bytes` under `key`.
  ///
  /// If the current handle already holds identical bytes it is returned
  /// unchanged. Otherwise a new handle is installed and the previous one is
  /// revoked in the same critical section.
  pub fn set(&self, key: &str, bytes: Vec<u8>) -> Handle {
    let mut entries = self.entries();

    if let Some(current) = entries.get(key) {
      if !current.is_revoked() && current.digest() == content_digest(&bytes) {
        debug!(key, url = %current.url(), "payload unchanged, keeping handle");
        return current.clone();
      }
    }

    let handle = self.registry.create(bytes);
    if let Some(previous) = entries.insert(key.to_string(), handle.clone()) {
      self.registry.revoke(&previous);
    }
    handle
  }

  /// Drop and revoke the handle for `key`.
  pub fn remove(&self, key: &str) -> bool {
    match self.entries().remove(key) {
      Some(handle) => self.registry.revoke(&handle),
      None => false,
    }
  }

  /// Revoke every handle.
  pub fn clear(&self) {
    let drained: Vec<Handle> = self.entries().drain().map(|(_, h)| h).collect();
    for handle in &drained {
      self.registry.revoke(handle);
    }
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Drop for HandleCache {
  fn drop(&mut self) {
    self.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_overwrite_revokes_previous_handle_once() {
    let registry = BlobRegistry::new();
    let cache = HandleCache::new(registry.clone());

    let first = cache.set("avatar", vec![1, 2, 3]);
    let second = cache.set("avatar", vec![4, 5, 6]);

    assert_ne!(first, second);
    assert!(first.is_revoked());
    assert!(!second.is_revoked());
    assert!(registry.lookup(first.url()).is_none());
    assert_eq!(registry.lookup(second.url()).as_deref(), Some(&[4u8, 5, 6][..]));
    assert_eq!(registry.live_count(), 1);

    // Already revoked, must not be revoked again
    assert!(!registry.revoke(&first));
  }

  #[test]
  fn test_identical_bytes_keep_the_live_handle() {
    let registry = BlobRegistry::new();
    let cache = HandleCache::new(registry.clone());

    let first = cache.set("avatar", b"same".to_vec());
    let again = cache.set("avatar", b"same".to_vec());

    assert_eq!(first, again);
    assert!(!first.is_revoked());
    assert_eq!(registry.live_count(), 1);
  }

  #[test]
  fn test_get_is_pure_lookup() {
    let cache = HandleCache::new(BlobRegistry::new());
    assert!(cache.get("missing").is_none());

    let handle = cache.set("k", vec![9]);
    let looked_up = cache.get("k").unwrap();
    assert_eq!(handle, looked_up);
    assert!(!looked_up.is_revoked());
  }

  #[test]
  fn test_clear_and_drop_revoke_everything() {
    let registry = BlobRegistry::new();
    let cache = HandleCache::new(registry.clone());
    let a = cache.set("a", vec![1]);
    let b = cache.set("b", vec![2]);

    cache.clear();
    assert!(a.is_revoked() && b.is_revoked());
    assert!(cache.is_empty());
    assert_eq!(registry.live_count(), 0);

    let c = cache.set("c", vec![3]);
    drop(cache);
    assert!(c.is_revoked());
    assert_eq!(registry.live_count(), 0);
  }

  #[test]
  fn test_remove_revokes_only_that_key() {
    let cache = HandleCache::new(BlobRegistry::new());
    let a = cache.set("a", vec![1]);
    let b = cache.set("b", vec![2]);

    assert!(cache.remove("a"));
    assert!(!cache.remove("a"));
    assert!(a.is_revoked());
    assert!(!b.is_revoked());
  }

  #[test]
  fn test_handle_urls_are_unique() {
    let registry = BlobRegistry::new();
    let a = registry.create(vec![1]);
    let b = registry.create(vec![1]);
    assert_ne!(a.url(), b.url());
    assert_eq!(a.digest(), b.digest());
    assert_eq!(a.digest(), content_digest(&[1]));
  }
}
