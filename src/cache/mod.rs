//! Layered caching for remote resources.
//!
//! This module provides the building blocks the client services are made of:
//! - Binary resources (avatars) resolved through memory handles, a persistent
//!   store with a time-to-live, and the network
//! - Append-only and upsert-style record logs mirrored into the store
//! - Deduplication of concurrent fetches for the same key
//! - A rate-limited poll of the server's per-class update timestamps

mod binary;
mod freshness;
mod handles;
mod inflight;
mod log;
mod storage;
mod traits;

pub use binary::{is_cacheable, AvatarCache, BinaryCache};
pub use freshness::{
  is_current, FreshnessPolicy, ResourceClass, UpdatePoller, UpdateTimestamps, DEFAULT_POLL_WINDOW_MS,
  DEFAULT_TTL_HOURS,
};
pub use handles::{content_digest, BlobRegistry, Handle, HandleCache};
pub use inflight::InFlightRegistry;
pub use log::{LogCache, LogCapacity, DEFAULT_OVERFLOW, DEFAULT_SOFT_CAP};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage, StoreKey, StoreName, StoredRow};
pub use traits::{CacheResult, CacheSource, LogRecord, RecordSource, ResourceFetcher, UpdateSource};
