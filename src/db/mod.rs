pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, error};

use crate::error::{CacheError, Result};

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DbLocation {
  File(PathBuf),
  /// Private in-memory database, gone when the process exits
  Memory,
}

type SharedConnection = Arc<Mutex<Connection>>;

/// Lazily opened, process-wide database connection.
///
/// The first caller opens the file and runs migrations; concurrent callers
/// wait for that same open. The outcome is memoized, including a failed
/// migration, so a broken schema keeps failing until the process restarts.
pub struct Database {
  location: DbLocation,
  conn: OnceCell<std::result::Result<SharedConnection, CacheError>>,
}

impl Database {
  /// Database backed by a file. Nothing is touched until first use.
  pub fn open(path: impl AsRef<Path>) -> Self {
    Self {
      location: DbLocation::File(path.as_ref().to_path_buf()),
      conn: OnceCell::new(),
    }
  }

  /// Database held entirely in memory.
  pub fn in_memory() -> Self {
    Self {
      location: DbLocation::Memory,
      conn: OnceCell::new(),
    }
  }

  /// Get the shared connection, opening and migrating on first use.
  pub async fn connection(&self) -> Result<SharedConnection> {
    let outcome = self
      .conn
      .get_or_init(|| {
        let location = self.location.clone();
        async move {
          match tokio::task::spawn_blocking(move || connect(&location)).await {
            Ok(result) => result,
            Err(e) => Err(CacheError::from(e)),
          }
        }
      })
      .await;

    outcome.clone()
  }

  /// Run a closure against the connection on the blocking thread pool.
  pub async fn run<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
  {
    let conn = self.connection().await?;
    tokio::task::spawn_blocking(move || {
      // A panic mid-statement leaves SQLite consistent; keep using the connection.
      let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
      f(&mut guard)
    })
    .await?
  }
}

fn connect(location: &DbLocation) -> Result<SharedConnection> {
  let mut conn = match location {
    DbLocation::File(path) => {
      // Ensure parent directory exists
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
          CacheError::Store(format!("Failed to create cache directory: {}", e))
        })?;
      }
      Connection::open(path).map_err(|e| {
        CacheError::Store(format!(
          "Failed to open cache database at {}: {}",
          path.display(),
          e
        ))
      })?
    }
    DbLocation::Memory => Connection::open_in_memory()?,
  };

  if let Err(e) = schema::migrate(&mut conn) {
    error!(error = %e, "cache database migration failed");
    return Err(e);
  }

  debug!(location = ?location, "cache database ready");
  Ok(Arc::new(Mutex::new(conn)))
}
