//! Per-key coalescing of concurrent operations.
//!
//! Each registered operation runs as its own tokio task and is exposed to
//! callers as a `Shared` future, so every caller that joins observes the same
//! outcome. A caller that stops waiting does not cancel the task; it still
//! completes and populates whatever caches it writes to.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

use crate::error::{CacheError, Result};

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Entry<T> {
  generation: u64,
  forced: bool,
  outcome: SharedOutcome<T>,
}

struct RegistryState<K, T> {
  next_generation: u64,
  entries: HashMap<K, Entry<T>>,
}

/// Registry of outstanding operations, at most one per key.
pub struct InFlightRegistry<K, T> {
  state: Arc<Mutex<RegistryState<K, T>>>,
}

impl<K, T> Default for InFlightRegistry<K, T> {
  fn default() -> Self {
    Self {
      state: Arc::new(Mutex::new(RegistryState {
        next_generation: 0,
        entries: HashMap::new(),
      })),
    }
  }
}

fn lock<K, T>(state: &Mutex<RegistryState<K, T>>) -> MutexGuard<'_, RegistryState<K, T>> {
  state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the registry entry when the owning task finishes, panics included.
struct SettleGuard<K: Eq + Hash, T> {
  state: Weak<Mutex<RegistryState<K, T>>>,
  key: Option<K>,
  generation: u64,
}

impl<K: Eq + Hash, T> Drop for SettleGuard<K, T> {
  fn drop(&mut self) {
    let (Some(state), Some(key)) = (self.state.upgrade(), self.key.take()) else {
      return;
    };
    let mut state = lock(&state);
    // A forced refresh may have replaced this entry; leave the newer one alone.
    if state
      .entries
      .get(&key)
      .is_some_and(|entry| entry.generation == self.generation)
    {
      state.entries.remove(&key);
    }
  }
}

impl<K, T> InFlightRegistry<K, T>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Join the outstanding operation for `key`, or start `operation`.
  pub async fn dedupe<F, Fut>(&self, key: K, operation: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    self.run(key, false, operation).await
  }

  /// Like `dedupe`, but with `force` a fresh operation is started unless
  /// another forced one is already running. The forced operation replaces
  /// the registry entry, so later non-forced callers join it, and starts only
  /// once the operation it replaced has settled.
  ///
  /// `operation` is invoked with the registry locked and must not call back
  /// into this registry synchronously.
  pub async fn run<F, Fut>(&self, key: K, force: bool, operation: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    self.join_or_start(key, force, operation).await
  }

  fn join_or_start<F, Fut>(&self, key: K, force: bool, operation: F) -> SharedOutcome<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let mut state = lock(&self.state);

    // A superseding forced operation starts after the one it replaces settles
    let mut superseded = None;
    if let Some(entry) = state.entries.get(&key) {
      if !force || entry.forced {
        return entry.outcome.clone();
      }
      superseded = Some(entry.outcome.clone());
    }

    let generation = state.next_generation;
    state.next_generation += 1;

    let guard = SettleGuard {
      state: Arc::downgrade(&self.state),
      key: Some(key.clone()),
      generation,
    };
    let work = operation();
    let task = tokio::spawn(async move {
      let _guard = guard;
      if let Some(previous) = superseded {
        let _ = previous.await;
      }
      work.await
    });

    let outcome: SharedOutcome<T> = async move {
      match task.await {
        Ok(result) => result,
        Err(e) => Err(CacheError::from(e)),
      }
    }
    .boxed()
    .shared();

    if state
      .entries
      .insert(
        key,
        Entry {
          generation,
          forced: force,
          outcome: outcome.clone(),
        },
      )
      .is_some()
    {
      debug!(generation, "forced operation superseded an in-flight one");
    }

    outcome
  }

  /// Whether an operation for `key` is outstanding.
  pub fn contains(&self, key: &K) -> bool {
    lock(&self.state).entries.contains_key(key)
  }

  pub fn len(&self) -> usize {
    lock(&self.state).entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
