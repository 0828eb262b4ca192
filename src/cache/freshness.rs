//! Freshness rules for cached entries and the server update poll.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::debug;

use super::inflight::InFlightRegistry;
use super::traits::UpdateSource;
use crate::error::Result;

/// Default age after which a binary record must be refetched.
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Default minimum spacing between two real update polls.
pub const DEFAULT_POLL_WINDOW_MS: u64 = 1000;

/// Time-to-live rule for binary records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
  ttl: Duration,
}

impl Default for FreshnessPolicy {
  fn default() -> Self {
    Self::new(Duration::hours(DEFAULT_TTL_HOURS))
  }
}

impl FreshnessPolicy {
  pub fn new(ttl: Duration) -> Self {
    Self { ttl }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// A record is fresh iff it is younger than the TTL and no refresh was forced.
  pub fn is_fresh(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>, force: bool) -> bool {
    !force && now - stored_at < self.ttl
  }
}

/// Whether a locally applied update is not behind the server's.
///
/// `None` means nothing was ever applied locally, which is always behind.
pub fn is_current(local: Option<i64>, server: i64, force: bool) -> bool {
  !force && local.is_some_and(|applied| applied >= server)
}

/// Resource classes the server reports update times for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
  Notice,
  User,
  Audit,
}

/// Body of `GET /system/updates`, milliseconds since the epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTimestamps {
  #[serde(default)]
  pub notice_last_updated: i64,
  #[serde(default)]
  pub user_last_updated: i64,
  #[serde(default)]
  pub audit_last_updated: i64,
}

impl UpdateTimestamps {
  pub fn get(&self, class: ResourceClass) -> i64 {
    match class {
      ResourceClass::Notice => self.notice_last_updated,
      ResourceClass::User => self.user_last_updated,
      ResourceClass::Audit => self.audit_last_updated,
    }
  }
}

type LastPoll = Arc<Mutex<Option<(Instant, UpdateTimestamps)>>>;

fn last_poll(
  last: &Mutex<Option<(Instant, UpdateTimestamps)>>,
) -> MutexGuard<'_, Option<(Instant, UpdateTimestamps)>> {
  last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deduplicated, rate-limited poll of the server update timestamps.
///
/// Concurrent callers share one request, and for `window` after a successful
/// poll callers get the remembered result without any request at all.
pub struct UpdatePoller<U> {
  source: Arc<U>,
  window: std::time::Duration,
  in_flight: InFlightRegistry<(), UpdateTimestamps>,
  last: LastPoll,
}

impl<U: UpdateSource> UpdatePoller<U> {
  pub fn new(source: Arc<U>, window: std::time::Duration) -> Self {
    Self {
      source,
      window,
      in_flight: InFlightRegistry::new(),
      last: Arc::new(Mutex::new(None)),
    }
  }

  /// Timestamps from the most recent successful poll, however old.
  pub fn latest(&self) -> Option<UpdateTimestamps> {
    let remembered = *last_poll(&self.last);
    remembered.map(|(_, updates)| updates)
  }

  pub async fn poll(&self) -> Result<UpdateTimestamps> {
    let remembered = *last_poll(&self.last);
    if let Some((at, updates)) = remembered {
      if at.elapsed() < self.window {
        debug!("update poll within window, reusing last result");
        return Ok(updates);
      }
    }

    let source = Arc::clone(&self.source);
    let last = Arc::clone(&self.last);
    self
      .in_flight
      .dedupe((), move || async move {
        let updates = source.fetch_updates().await?;
        *last_poll(&last) = Some((Instant::now(), updates));
        Ok(updates)
      })
      .await
  }
}
