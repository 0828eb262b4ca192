//! Versioned schema for the cache database.
//!
//! The version lives in `PRAGMA user_version`. Each step only runs when the
//! stored version is below its own, and every statement is written so that
//! running it twice is harmless.

use rusqlite::Connection;
use tracing::info;

use crate::error::{CacheError, Result};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Tables left behind by the one-database-per-store layout.
pub const OBSOLETE_TABLES: &[&str] = &["avatar_cache", "chat_cache", "notice_cache"];

struct Migration {
  version: i32,
  sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    sql: V1_STORES,
  },
  Migration {
    version: 2,
    sql: V2_SYNC_STATE,
  },
];

const V1_STORES: &str = r#"
-- Binary resources (avatars), keyed by resource key
CREATE TABLE IF NOT EXISTS avatars (
    key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    stored_at INTEGER NOT NULL
);

-- Chat messages, keyed by server-assigned id
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    payload BLOB NOT NULL,
    stored_at INTEGER NOT NULL
);

-- Notices, keyed by server-assigned id
CREATE TABLE IF NOT EXISTS notices (
    id INTEGER PRIMARY KEY,
    payload BLOB NOT NULL,
    stored_at INTEGER NOT NULL
);
"#;

const V2_SYNC_STATE: &str = r#"
DROP TABLE IF EXISTS avatar_cache;
DROP TABLE IF EXISTS chat_cache;
DROP TABLE IF EXISTS notice_cache;

-- Last applied server update per resource class
CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    stored_at INTEGER NOT NULL
);
"#;

/// Bring the database up to `SCHEMA_VERSION`.
///
/// All pending steps run in one transaction; on failure nothing is applied
/// and the error is reported as `CacheError::Migration`.
pub fn migrate(conn: &mut Connection) -> Result<()> {
  let current: i32 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| CacheError::Migration(format!("Failed to read schema version: {}", e)))?;

  if current > SCHEMA_VERSION {
    return Err(CacheError::Migration(format!(
      "database schema version {} is newer than supported version {}",
      current, SCHEMA_VERSION
    )));
  }
  if current == SCHEMA_VERSION {
    return Ok(());
  }

  let tx = conn
    .transaction()
    .map_err(|e| CacheError::Migration(format!("Failed to begin migration: {}", e)))?;

  for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
    tx.execute_batch(migration.sql).map_err(|e| {
      CacheError::Migration(format!("Migration to v{} failed: {}", migration.version, e))
    })?;
    info!(version = migration.version, "applied cache schema migration");
  }

  tx.pragma_update(None, "user_version", SCHEMA_VERSION)
    .map_err(|e| CacheError::Migration(format!("Failed to record schema version: {}", e)))?;
  tx.commit()
    .map_err(|e| CacheError::Migration(format!("Failed to commit migration: {}", e)))?;

  Ok(())
}
