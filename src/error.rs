//! Error type shared by every cache tier.

use thiserror::Error;

/// Failures surfaced by the cache tiers.
///
/// Cache misses are never errors: lookups return `Ok(None)` for absent
/// values. The type is `Clone` because callers that join an in-flight
/// operation all receive the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
  #[error("Store error: {0}")]
  Store(String),

  #[error("Schema migration failed: {0}")]
  Migration(String),

  #[error("HTTP {status}: {message}")]
  Http { status: u16, message: String },

  #[error("Network error: {0}")]
  Network(String),

  #[error("Invalid payload: {0}")]
  Decode(String),

  #[error("Operation aborted: {0}")]
  Aborted(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 300;

impl CacheError {
  /// Build an HTTP error from a status code and response body.
  pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
    let message = if body.len() <= MAX_ERROR_BODY_LENGTH {
      body.to_string()
    } else {
      let mut end = MAX_ERROR_BODY_LENGTH;
      while !body.is_char_boundary(end) {
        end -= 1;
      }
      format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    };
    CacheError::Http {
      status: status.as_u16(),
      message,
    }
  }

  /// Whether retrying the same operation later could succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      CacheError::Store(_) | CacheError::Network(_) | CacheError::Aborted(_) => true,
      CacheError::Http { status, .. } => *status == 429 || *status >= 500,
      CacheError::Migration(_) | CacheError::Decode(_) => false,
    }
  }
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    CacheError::Store(e.to_string())
  }
}

impl From<reqwest::Error> for CacheError {
  fn from(e: reqwest::Error) -> Self {
    match e.status() {
      Some(status) => CacheError::Http {
        status: status.as_u16(),
        message: e.to_string(),
      },
      None => CacheError::Network(e.to_string()),
    }
  }
}

impl From<serde_json::Error> for CacheError {
  fn from(e: serde_json::Error) -> Self {
    CacheError::Decode(e.to_string())
  }
}

impl From<tokio::task::JoinError> for CacheError {
  fn from(e: tokio::task::JoinError) -> Self {
    CacheError::Aborted(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, CacheError>;
