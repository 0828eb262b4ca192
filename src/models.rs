//! Records kept in the log caches.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::cache::LogRecord;

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
  pub id: i64,
  pub sender: String,
  pub content: String,
  /// Milliseconds since the epoch
  pub timestamp: i64,
}

impl LogRecord for Message {
  fn id(&self) -> i64 {
    self.id
  }

  fn ordering_key(&self) -> i64 {
    self.timestamp
  }
}

/// Announcement shown on the notice board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
  pub id: i64,
  pub title: String,
  pub content: String,
  #[serde(default)]
  pub pinned: bool,
  pub author_username: String,
  pub created_at: i64,
  pub updated_at: i64,
}

impl LogRecord for Notice {
  fn id(&self) -> i64 {
    self.id
  }

  fn ordering_key(&self) -> i64 {
    self.created_at
  }
}

/// Display order for notices: pinned first, then newest first.
pub fn notice_display_order(a: &Notice, b: &Notice) -> Ordering {
  b.pinned
    .cmp(&a.pinned)
    .then_with(|| b.created_at.cmp(&a.created_at))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn notice(id: i64, pinned: bool, created_at: i64) -> Notice {
    Notice {
      id,
      title: format!("notice {}", id),
      content: String::new(),
      pinned,
      author_username: "admin".into(),
      created_at,
      updated_at: created_at,
    }
  }

  #[test]
  fn test_notice_display_order() {
    let mut notices = vec![
      notice(1, false, 10),
      notice(2, true, 5),
      notice(3, false, 30),
      notice(4, true, 20),
    ];
    notices.sort_by(notice_display_order);
    let ids: Vec<i64> = notices.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![4, 2, 3, 1]);
  }

  #[test]
  fn test_notice_uses_camel_case_fields() {
    let json = r#"{"id":7,"title":"t","content":"c","pinned":true,
      "authorUsername":"mika","createdAt":1,"updatedAt":2}"#;
    let parsed: Notice = serde_json::from_str(json).unwrap();
    assert_eq!(parsed.author_username, "mika");
    assert!(parsed.pinned);
    assert_eq!(parsed.ordering_key(), 1);
  }
}
