//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;

use super::freshness::UpdateTimestamps;
use crate::error::Result;

/// Source of raw bytes for binary resources (avatars).
pub trait ResourceFetcher: Send + Sync + 'static {
  /// Download the resource identified by `key`.
  fn fetch_bytes(&self, key: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Source of the server's per-resource-class "last updated" timestamps.
pub trait UpdateSource: Send + Sync + 'static {
  fn fetch_updates(&self) -> impl Future<Output = Result<UpdateTimestamps>> + Send;
}

/// Remote source of truth for a record collection.
pub trait RecordSource<R>: Send + Sync + 'static {
  /// The full current collection.
  fn fetch_all(&self) -> impl Future<Output = Result<Vec<R>>> + Send;

  /// A single record, `None` when the server no longer has it.
  fn fetch_one(&self, id: i64) -> impl Future<Output = Result<Option<R>>> + Send;
}

/// Trait for records kept in a log cache.
///
/// Implementors provide a unique, externally assigned id and the field the
/// in-memory sequence is ordered by.
pub trait LogRecord: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier (e.g., message id, notice id)
  fn id(&self) -> i64;

  /// Ordering field, ascending (e.g., timestamp in milliseconds)
  fn ordering_key(&self) -> i64;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was persisted (if from the store)
  pub stored_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      stored_at: None,
    }
  }

  /// Create a new cache result served from process memory.
  pub fn from_memory(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Memory,
      stored_at: None,
    }
  }

  /// Create a new cache result from the persistent store.
  pub fn from_store(data: T, stored_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Store,
      stored_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      stored_at: None,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Handle or record already held in memory
  Memory,
  /// Fresh record read back from the persistent store
  Store,
  /// Fresh data from network
  Network,
  /// Network unavailable, serving the local replica
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      CacheSource::Memory => "memory",
      CacheSource::Store => "store",
      CacheSource::Network => "network",
      CacheSource::Offline => "offline",
    };
    f.write_str(name)
  }
}
