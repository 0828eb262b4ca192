//! Bounded, ordered local replica of a record log.
//!
//! The in-memory sequence is hydrated once from the persistent store and then
//! kept in step with it: appends are idempotent by record id, and when the
//! sequence grows past `soft_cap + overflow` both the store and the sequence
//! are cut back to the newest `soft_cap` records.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use super::storage::{CacheStorage, StoreKey, StoreName, StoredRow};
use super::traits::LogRecord;
use crate::error::Result;

/// Default number of records retained.
pub const DEFAULT_SOFT_CAP: usize = 1000;

/// Default slack above the soft cap before trimming kicks in.
pub const DEFAULT_OVERFLOW: usize = 100;

/// Retention limits for a log cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCapacity {
  pub soft_cap: usize,
  pub overflow: usize,
}

impl Default for LogCapacity {
  fn default() -> Self {
    Self {
      soft_cap: DEFAULT_SOFT_CAP,
      overflow: DEFAULT_OVERFLOW,
    }
  }
}

impl LogCapacity {
  /// Size above which a trim is triggered.
  pub fn high_water(&self) -> usize {
    self.soft_cap.saturating_add(self.overflow)
  }
}

struct LogState<R> {
  records: Vec<R>,
  ids: HashSet<i64>,
}

impl<R: LogRecord> LogState<R> {
  fn rebuild(&mut self, records: Vec<R>) {
    self.ids = records.iter().map(R::id).collect();
    self.records = records;
  }
}

/// Sort ascending by ordering field and drop repeated ids, keeping the last.
fn normalize<R: LogRecord>(records: Vec<R>) -> Vec<R> {
  let mut seen = HashSet::new();
  let mut unique: Vec<R> = records
    .into_iter()
    .rev()
    .filter(|r| seen.insert(r.id()))
    .collect();
  unique.reverse();
  unique.sort_by_key(R::ordering_key);
  unique
}

fn encode<R: LogRecord>(record: &R) -> Result<StoredRow> {
  Ok(StoredRow::new(record.id(), serde_json::to_vec(record)?))
}

/// Replica of one logical store of `R` records.
pub struct LogCache<R, S> {
  store: StoreName,
  storage: Arc<S>,
  capacity: Option<LogCapacity>,
  state: Mutex<LogState<R>>,
  loaded: OnceCell<()>,
  /// Record writes hold it shared, `clear` exclusively
  writes: RwLock<()>,
}

impl<R: LogRecord, S: CacheStorage> LogCache<R, S> {
  /// Log cache without retention limit (upsert-style collections).
  pub fn new(store: StoreName, storage: Arc<S>) -> Self {
    Self {
      store,
      storage,
      capacity: None,
      state: Mutex::new(LogState {
        records: Vec::new(),
        ids: HashSet::new(),
      }),
      loaded: OnceCell::new(),
      writes: RwLock::new(()),
    }
  }

  /// Log cache trimmed back to `capacity.soft_cap` records.
  pub fn bounded(store: StoreName, storage: Arc<S>, capacity: LogCapacity) -> Self {
    Self {
      capacity: Some(capacity),
      ..Self::new(store, storage)
    }
  }

  fn state(&self) -> MutexGuard<'_, LogState<R>> {
    self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn is_loaded(&self) -> bool {
    self.loaded.initialized()
  }

  /// Hydrate the in-memory sequence from the store. Runs once; later and
  /// concurrent calls wait for that first run. A failing store yields an
  /// empty history.
  pub async fn load(&self) {
    self
      .loaded
      .get_or_init(|| async {
        let rows = match self.storage.get_all(self.store).await {
          Ok(rows) => rows,
          Err(e) => {
            warn!(store = %self.store, error = %e, "failed to read log history");
            Vec::new()
          }
        };

        let mut records: Vec<R> = rows
          .into_iter()
          .filter_map(|row| match serde_json::from_slice::<R>(&row.payload) {
            Ok(record) => Some(record),
            Err(e) => {
              warn!(store = %self.store, key = %row.key, error = %e, "skipping malformed record");
              None
            }
          })
          .collect();

        let mut state = self.state();
        // Keep anything recorded before hydration finished
        records.extend(state.records.drain(..));
        let records = normalize(records);
        debug!(store = %self.store, count = records.len(), "log history loaded");
        state.rebuild(records);
      })
      .await;
  }

  /// Add a record at the tail. Returns `false` if a record with the same id
  /// is already present.
  ///
  /// The write to the store is opportunistic: failures are logged and the
  /// record stays in memory.
  pub async fn append(&self, record: R) -> Result<bool> {
    let row = encode(&record)?;
    let write = self.writes.read().await;
    {
      let mut state = self.state();
      if !state.ids.insert(record.id()) {
        debug!(store = %self.store, id = record.id(), "duplicate record ignored");
        return Ok(false);
      }
      state.records.push(record);
    }

    if let Err(e) = self.storage.put(self.store, row).await {
      warn!(store = %self.store, error = %e, "failed to persist record");
    }
    drop(write);

    self.enforce_capacity().await;
    Ok(true)
  }

  /// Insert or replace a record by id, keeping the sequence ordered.
  pub async fn upsert(&self, record: R) -> Result<()> {
    let row = encode(&record)?;
    let write = self.writes.read().await;
    self.upsert_in_memory(record);

    if let Err(e) = self.storage.put(self.store, row).await {
      warn!(store = %self.store, error = %e, "failed to persist record");
    }
    drop(write);
    self.enforce_capacity().await;
    Ok(())
  }

  /// Upsert several records with a single store transaction.
  pub async fn upsert_many(&self, records: Vec<R>) -> Result<()> {
    let rows = records.iter().map(encode).collect::<Result<Vec<_>>>()?;
    let write = self.writes.read().await;
    for record in records {
      self.upsert_in_memory(record);
    }

    if let Err(e) = self.storage.put_many(self.store, rows).await {
      warn!(store = %self.store, error = %e, "failed to persist records");
    }
    drop(write);
    self.enforce_capacity().await;
    Ok(())
  }

  fn upsert_in_memory(&self, record: R) {
    let mut state = self.state();
    let id = record.id();
    if state.ids.contains(&id) {
      state.records.retain(|r| r.id() != id);
    } else {
      state.ids.insert(id);
    }
    let at = state
      .records
      .partition_point(|r| r.ordering_key() <= record.ordering_key());
    state.records.insert(at, record);
  }

  /// Swap the whole replica for `records`, in memory and in the store.
  pub async fn replace_all(&self, records: Vec<R>) -> Result<()> {
    let records = normalize(records);
    let rows = records.iter().map(encode).collect::<Result<Vec<_>>>()?;
    let _write = self.writes.read().await;
    self.state().rebuild(records);
    self.storage.replace_all(self.store, rows).await
  }

  /// Remove one record by id.
  pub async fn remove(&self, id: i64) -> Result<bool> {
    let _write = self.writes.read().await;
    let removed = {
      let mut state = self.state();
      if state.ids.remove(&id) {
        state.records.retain(|r| r.id() != id);
        true
      } else {
        false
      }
    };
    self.storage.delete(self.store, StoreKey::Int(id)).await?;
    Ok(removed)
  }

  /// Empty the in-memory sequence and the store. The in-memory side is
  /// always cleared; a store failure is returned to the caller.
  ///
  /// Writes already under way land before the clear, never after it.
  pub async fn clear(&self) -> Result<()> {
    let _exclusive = self.writes.write().await;
    self.state().rebuild(Vec::new());
    self.storage.clear(self.store).await.map_err(|e| {
      warn!(store = %self.store, error = %e, "failed to clear log store");
      e
    })
  }

  pub fn get(&self, id: i64) -> Option<R> {
    self.state().records.iter().find(|r| r.id() == id).cloned()
  }

  pub fn contains(&self, id: i64) -> bool {
    self.state().ids.contains(&id)
  }

  /// Copy of the in-memory sequence, oldest first.
  pub fn snapshot(&self) -> Vec<R> {
    self.state().records.clone()
  }

  pub fn len(&self) -> usize {
    self.state().records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  async fn enforce_capacity(&self) {
    let Some(capacity) = self.capacity else {
      return;
    };
    if self.len() <= capacity.high_water() {
      return;
    }

    match self.storage.trim(self.store, capacity.soft_cap).await {
      Ok(deleted) => info!(store = %self.store, deleted, "trimmed log store"),
      Err(e) => warn!(store = %self.store, error = %e, "failed to trim log store"),
    }

    let mut state = self.state();
    let excess = state.records.len().saturating_sub(capacity.soft_cap);
    if excess > 0 {
      let dropped: Vec<R> = state.records.drain(..excess).collect();
      for record in &dropped {
        state.ids.remove(&record.id());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{NoopStorage, SlowWrites, SqliteStorage};
  use crate::models::Message;
  use std::time::Duration;

  fn message(id: i64, timestamp: i64) -> Message {
    Message {
      id,
      sender: "yuki".into(),
      content: format!("message {}", id),
      timestamp,
    }
  }

  fn chat(storage: &Arc<SqliteStorage>, capacity: LogCapacity) -> LogCache<Message, SqliteStorage> {
    LogCache::bounded(StoreName::Messages, storage.clone(), capacity)
  }

  #[tokio::test]
  async fn test_duplicate_append_keeps_one_record() {
    let storage = Arc::new(SqliteStorage::in_memory());
    let log = chat(&storage, LogCapacity::default());
    log.load().await;

    assert!(log.append(message(1, 10)).await.unwrap());
    assert!(!log.append(message(1, 10)).await.unwrap());

    assert_eq!(log.len(), 1);
    assert_eq!(storage.count(StoreName::Messages).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_load_sorts_by_ordering_field_and_runs_once() {
    let storage = Arc::new(SqliteStorage::in_memory());
    for (id, ts) in [(1i64, 300), (2, 100), (3, 200)] {
      storage
        .put(StoreName::Messages, encode(&message(id, ts)).unwrap())
        .await
        .unwrap();
    }

    let log = chat(&storage, LogCapacity::default());
    assert!(!log.is_loaded());
    log.load().await;
    let ids: Vec<i64> = log.snapshot().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![2, 3, 1]);

    // A record written behind the cache's back is not picked up again
    storage
      .put(StoreName::Messages, encode(&message(4, 400)).unwrap())
      .await
      .unwrap();
    log.load().await;
    assert_eq!(log.len(), 3);
  }

  #[tokio::test]
  async fn test_load_skips_malformed_rows() {
    let storage = Arc::new(SqliteStorage::in_memory());
    storage
      .put(StoreName::Messages, StoredRow::new(1i64, b"not json".to_vec()))
      .await
      .unwrap();
    storage
      .put(StoreName::Messages, encode(&message(2, 5)).unwrap())
      .await
      .unwrap();

    let log = chat(&storage, LogCapacity::default());
    log.load().await;
    assert_eq!(log.snapshot(), vec![message(2, 5)]);
  }

  #[tokio::test]
  async fn test_overflow_trims_memory_and_store_to_soft_cap() {
    let storage = Arc::new(SqliteStorage::in_memory());
    let log = chat(
      &storage,
      LogCapacity {
        soft_cap: 1000,
        overflow: 100,
      },
    );
    log.load().await;

    for id in 1..=1100i64 {
      log.append(message(id, id)).await.unwrap();
    }
    assert_eq!(log.len(), 1100);
    assert_eq!(storage.count(StoreName::Messages).await.unwrap(), 1100);

    log.append(message(1101, 1101)).await.unwrap();
    assert!(log.len() <= 1000);
    assert!(storage.count(StoreName::Messages).await.unwrap() <= 1000);

    let snapshot = log.snapshot();
    assert_eq!(snapshot.first().map(|m| m.id), Some(102));
    assert_eq!(snapshot.last().map(|m| m.id), Some(1101));
    // Trimmed ids may be appended again
    assert!(!log.contains(1));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_appends_racing_a_trim_keep_newest_records() {
    let storage = Arc::new(SqliteStorage::in_memory());
    let capacity = LogCapacity {
      soft_cap: 20,
      overflow: 5,
    };
    let log = Arc::new(chat(&storage, capacity));
    log.load().await;

    for id in 1..=25i64 {
      log.append(message(id, id)).await.unwrap();
    }
    assert_eq!(storage.count(StoreName::Messages).await.unwrap(), 25);

    let batch = 26..36i64;
    let appends = batch.clone().map(|id| {
      let log = Arc::clone(&log);
      async move { log.append(message(id, id)).await }
    });
    for appended in futures::future::join_all(appends).await {
      assert!(appended.unwrap());
    }

    let count = storage.count(StoreName::Messages).await.unwrap();
    assert!(
      (capacity.soft_cap..=capacity.soft_cap + 10).contains(&count),
      "{} rows left",
      count
    );

    let stored: HashSet<StoreKey> = storage
      .get_all(StoreName::Messages)
      .await
      .unwrap()
      .into_iter()
      .map(|row| row.key)
      .collect();
    for id in batch {
      assert!(stored.contains(&StoreKey::Int(id)), "record {} was trimmed", id);
      assert!(log.contains(id));
    }
  }

  #[tokio::test]
  async fn test_clear_waits_for_write_in_progress() {
    let storage = Arc::new(SlowWrites {
      inner: SqliteStorage::in_memory(),
      delay: Duration::from_millis(40),
    });
    let log: LogCache<Message, SlowWrites> = LogCache::new(StoreName::Messages, storage.clone());
    log.load().await;

    let clear = async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      log.clear().await
    };
    let (appended, cleared) = tokio::join!(log.append(message(1, 1)), clear);
    assert!(appended.unwrap());
    cleared.unwrap();

    assert!(log.is_empty());
    assert_eq!(storage.count(StoreName::Messages).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_clear_then_fresh_load_is_empty() {
    let storage = Arc::new(SqliteStorage::in_memory());
    let log = chat(&storage, LogCapacity::default());
    log.load().await;
    log.append(message(1, 1)).await.unwrap();
    log.append(message(2, 2)).await.unwrap();

    log.clear().await.unwrap();
    assert!(log.is_empty());

    let fresh = chat(&storage, LogCapacity::default());
    fresh.load().await;
    assert!(fresh.is_empty());
  }

  #[tokio::test]
  async fn test_upsert_replaces_in_place_and_keeps_order() {
    let storage = Arc::new(SqliteStorage::in_memory());
    let log: LogCache<Message, SqliteStorage> = LogCache::new(StoreName::Messages, storage.clone());
    log.load().await;

    log
      .upsert_many(vec![message(1, 10), message(2, 30), message(3, 20)])
      .await
      .unwrap();
    let mut edited = message(2, 30);
    edited.content = "edited".into();
    log.upsert(edited.clone()).await.unwrap();

    let ids: Vec<i64> = log.snapshot().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![1, 3, 2]);
    assert_eq!(log.get(2), Some(edited));
    assert_eq!(storage.count(StoreName::Messages).await.unwrap(), 3);
  }

  #[tokio::test]
  async fn test_replace_all_and_remove() {
    let storage = Arc::new(SqliteStorage::in_memory());
    let log: LogCache<Message, SqliteStorage> = LogCache::new(StoreName::Notices, storage.clone());
    log.load().await;
    log.append(message(9, 9)).await.unwrap();

    log
      .replace_all(vec![message(1, 1), message(2, 2), message(1, 3)])
      .await
      .unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log.get(1).map(|m| m.timestamp), Some(3));
    assert!(!log.contains(9));
    assert_eq!(storage.count(StoreName::Notices).await.unwrap(), 2);

    assert!(log.remove(1).await.unwrap());
    assert!(!log.remove(1).await.unwrap());
    assert_eq!(storage.count(StoreName::Notices).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_append_without_persistence_still_works_in_memory() {
    let log: LogCache<Message, NoopStorage> = LogCache::bounded(
      StoreName::Messages,
      Arc::new(NoopStorage),
      LogCapacity {
        soft_cap: 3,
        overflow: 1,
      },
    );
    log.load().await;
    for id in 1..=5i64 {
      log.append(message(id, id)).await.unwrap();
    }
    let ids: Vec<i64> = log.snapshot().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![3, 4, 5]);
  }
}
