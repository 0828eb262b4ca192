//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::db::Database;
use crate::error::Result;

/// Logical stores inside the cache database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreName {
  /// Binary resources with their fetch time
  Avatars,
  /// Chat messages keyed by id
  Messages,
  /// Notices keyed by id
  Notices,
  /// Per-resource-class sync markers
  SyncState,
}

impl StoreName {
  pub const ALL: [StoreName; 4] = [
    StoreName::Avatars,
    StoreName::Messages,
    StoreName::Notices,
    StoreName::SyncState,
  ];

  fn table(self) -> &'static str {
    match self {
      StoreName::Avatars => "avatars",
      StoreName::Messages => "messages",
      StoreName::Notices => "notices",
      StoreName::SyncState => "sync_state",
    }
  }

  fn key_column(self) -> &'static str {
    match self {
      StoreName::Messages | StoreName::Notices => "id",
      StoreName::Avatars | StoreName::SyncState => "key",
    }
  }
}

impl fmt::Display for StoreName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.table())
  }
}

/// Primary key of a stored row. Integer keys sort before text keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKey {
  Int(i64),
  Text(String),
}

impl From<i64> for StoreKey {
  fn from(id: i64) -> Self {
    StoreKey::Int(id)
  }
}

impl From<&str> for StoreKey {
  fn from(key: &str) -> Self {
    StoreKey::Text(key.to_string())
  }
}

impl From<String> for StoreKey {
  fn from(key: String) -> Self {
    StoreKey::Text(key)
  }
}

impl fmt::Display for StoreKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StoreKey::Int(id) => write!(f, "{}", id),
      StoreKey::Text(key) => f.write_str(key),
    }
  }
}

impl ToSql for StoreKey {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    match self {
      StoreKey::Int(id) => Ok(ToSqlOutput::from(*id)),
      StoreKey::Text(key) => Ok(ToSqlOutput::from(key.as_str())),
    }
  }
}

impl FromSql for StoreKey {
  fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
    match value {
      ValueRef::Integer(id) => Ok(StoreKey::Int(id)),
      ValueRef::Text(text) => Ok(StoreKey::Text(String::from_utf8_lossy(text).into_owned())),
      _ => Err(FromSqlError::InvalidType),
    }
  }
}

/// One record in a logical store. Rows are written wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
  pub key: StoreKey,
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl StoredRow {
  pub fn new(key: impl Into<StoreKey>, payload: Vec<u8>) -> Self {
    Self {
      key: key.into(),
      payload,
      stored_at: Utc::now(),
    }
  }
}

/// Trait for cache storage backends.
///
/// Absence is a normal value (`Ok(None)`, empty vec); errors are reserved
/// for genuine I/O or schema failures.
pub trait CacheStorage: Send + Sync + 'static {
  /// Insert or overwrite a row.
  fn put(&self, store: StoreName, row: StoredRow) -> impl Future<Output = Result<()>> + Send;

  /// Insert or overwrite several rows in one transaction.
  fn put_many(
    &self,
    store: StoreName,
    rows: Vec<StoredRow>,
  ) -> impl Future<Output = Result<()>> + Send;

  /// Get a single row by key.
  fn get(
    &self,
    store: StoreName,
    key: StoreKey,
  ) -> impl Future<Output = Result<Option<StoredRow>>> + Send;

  /// Every row in the store. Callers must not rely on the order.
  fn get_all(&self, store: StoreName) -> impl Future<Output = Result<Vec<StoredRow>>> + Send;

  fn delete(&self, store: StoreName, key: StoreKey) -> impl Future<Output = Result<()>> + Send;

  fn clear(&self, store: StoreName) -> impl Future<Output = Result<()>> + Send;

  fn count(&self, store: StoreName) -> impl Future<Output = Result<usize>> + Send;

  /// Delete the oldest rows (ascending key order) until at most `keep`
  /// remain. Returns how many rows were removed.
  fn trim(&self, store: StoreName, keep: usize) -> impl Future<Output = Result<usize>> + Send;

  /// Atomically swap the whole content of a store.
  fn replace_all(
    &self,
    store: StoreName,
    rows: Vec<StoredRow>,
  ) -> impl Future<Output = Result<()>> + Send;
}

/// Storage implementation that doesn't cache anything.
/// Used when persistence is disabled - all operations are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  async fn put(&self, _store: StoreName, _row: StoredRow) -> Result<()> {
    Ok(()) // Discard
  }

  async fn put_many(&self, _store: StoreName, _rows: Vec<StoredRow>) -> Result<()> {
    Ok(()) // Discard
  }

  async fn get(&self, _store: StoreName, _key: StoreKey) -> Result<Option<StoredRow>> {
    Ok(None) // Always miss
  }

  async fn get_all(&self, _store: StoreName) -> Result<Vec<StoredRow>> {
    Ok(Vec::new())
  }

  async fn delete(&self, _store: StoreName, _key: StoreKey) -> Result<()> {
    Ok(())
  }

  async fn clear(&self, _store: StoreName) -> Result<()> {
    Ok(())
  }

  async fn count(&self, _store: StoreName) -> Result<usize> {
    Ok(0)
  }

  async fn trim(&self, _store: StoreName, _keep: usize) -> Result<usize> {
    Ok(0)
  }

  async fn replace_all(&self, _store: StoreName, _rows: Vec<StoredRow>) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
///
/// Cheap to clone; every clone shares the same lazily opened database.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db: Arc::new(db) }
  }

  pub fn in_memory() -> Self {
    Self::new(Database::in_memory())
  }
}

fn write_row(conn: &Connection, store: StoreName, row: &StoredRow) -> Result<()> {
  let sql = format!(
    "INSERT OR REPLACE INTO {} ({}, payload, stored_at) VALUES (?1, ?2, ?3)",
    store.table(),
    store.key_column()
  );
  conn.execute(
    &sql,
    params![row.key, row.payload, row.stored_at.timestamp_millis()],
  )?;
  Ok(())
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
  let stored_at_ms: i64 = row.get(2)?;
  Ok(StoredRow {
    key: row.get(0)?,
    payload: row.get(1)?,
    stored_at: DateTime::from_timestamp_millis(stored_at_ms).unwrap_or_default(),
  })
}

impl CacheStorage for SqliteStorage {
  async fn put(&self, store: StoreName, row: StoredRow) -> Result<()> {
    self.db.run(move |conn| write_row(conn, store, &row)).await
  }

  async fn put_many(&self, store: StoreName, rows: Vec<StoredRow>) -> Result<()> {
    self
      .db
      .run(move |conn| {
        let tx = conn.transaction()?;
        for row in &rows {
          write_row(&tx, store, row)?;
        }
        tx.commit()?;
        Ok(())
      })
      .await
  }

  async fn get(&self, store: StoreName, key: StoreKey) -> Result<Option<StoredRow>> {
    self
      .db
      .run(move |conn| {
        let sql = format!(
          "SELECT {k}, payload, stored_at FROM {t} WHERE {k} = ?1",
          k = store.key_column(),
          t = store.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![key], read_row)?;
        let row = rows.next().transpose()?;
        Ok(row)
      })
      .await
  }

  async fn get_all(&self, store: StoreName) -> Result<Vec<StoredRow>> {
    self
      .db
      .run(move |conn| {
        let sql = format!(
          "SELECT {k}, payload, stored_at FROM {t} ORDER BY {k}",
          k = store.key_column(),
          t = store.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map([], read_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await
  }

  async fn delete(&self, store: StoreName, key: StoreKey) -> Result<()> {
    self
      .db
      .run(move |conn| {
        let sql = format!(
          "DELETE FROM {} WHERE {} = ?1",
          store.table(),
          store.key_column()
        );
        conn.execute(&sql, params![key])?;
        Ok(())
      })
      .await
  }

  async fn clear(&self, store: StoreName) -> Result<()> {
    self
      .db
      .run(move |conn| {
        conn.execute(&format!("DELETE FROM {}", store.table()), [])?;
        Ok(())
      })
      .await
  }

  async fn count(&self, store: StoreName) -> Result<usize> {
    self
      .db
      .run(move |conn| {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", store.table()), [], |r| {
          r.get(0)
        })?;
        Ok(n.max(0) as usize)
      })
      .await
  }

  async fn trim(&self, store: StoreName, keep: usize) -> Result<usize> {
    self
      .db
      .run(move |conn| {
        // Count and delete inside one transaction so rows written by a
        // concurrent append are never part of the doomed set.
        let tx = conn.transaction()?;
        let count: i64 =
          tx.query_row(&format!("SELECT COUNT(*) FROM {}", store.table()), [], |r| {
            r.get(0)
          })?;
        let excess = (count.max(0) as usize).saturating_sub(keep);
        let deleted = if excess > 0 {
          let sql = format!(
            "DELETE FROM {t} WHERE {k} IN (SELECT {k} FROM {t} ORDER BY {k} ASC LIMIT ?1)",
            t = store.table(),
            k = store.key_column()
          );
          tx.execute(&sql, params![excess as i64])?
        } else {
          0
        };
        tx.commit()?;
        Ok(deleted)
      })
      .await
  }

  async fn replace_all(&self, store: StoreName, rows: Vec<StoredRow>) -> Result<()> {
    self
      .db
      .run(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", store.table()), [])?;
        for row in &rows {
          write_row(&tx, store, row)?;
        }
        tx.commit()?;
        Ok(())
      })
      .await
  }
}


/// SQLite storage whose writes are delayed, for ordering tests.
#[cfg(test)]
pub(crate) struct SlowWrites {
  pub inner: SqliteStorage,
  pub delay: std::time::Duration,
}

#[cfg(test)]
impl CacheStorage for SlowWrites {
  async fn put(&self, store: StoreName, row: StoredRow) -> Result<()> {
    tokio::time::sleep(self.delay).await;
    self.inner.put(store, row).await
  }

  async fn put_many(&self, store: StoreName, rows: Vec<StoredRow>) -> Result<()> {
    tokio::time::sleep(self.delay).await;
    self.inner.put_many(store, rows).await
  }

  async fn get(&self, store: StoreName, key: StoreKey) -> Result<Option<StoredRow>> {
    self.inner.get(store, key).await
  }

  async fn get_all(&self, store: StoreName) -> Result<Vec<StoredRow>> {
    self.inner.get_all(store).await
  }

  async fn delete(&self, store: StoreName, key: StoreKey) -> Result<()> {
    self.inner.delete(store, key).await
  }

  async fn clear(&self, store: StoreName) -> Result<()> {
    self.inner.clear(store).await
  }

  async fn count(&self, store: StoreName) -> Result<usize> {
    self.inner.count(store).await
  }

  async fn trim(&self, store: StoreName, keep: usize) -> Result<usize> {
    self.inner.trim(store, keep).await
  }

  async fn replace_all(&self, store: StoreName, rows: Vec<StoredRow>) -> Result<()> {
    self.inner.replace_all(store, rows).await
  }
}
