//! Filters accepted by the post repository.
//!
//! Keep these structs focused on query shape. Business rules (who may see
//! what) live in the service layer.

use chrono::{DateTime, Utc};

/// Optional constraints applied to post queries. `None` fields are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostFilter {
    pub author_id: Option<i64>,
    pub published: Option<bool>,
    /// Only posts whose `publish_at` is set and at or before this instant.
    pub due_before: Option<DateTime<Utc>>,
}

impl PostFilter {
    pub fn published() -> Self {
        Self {
            published: Some(true),
            ..Default::default()
        }
    }

    /// Unpublished posts whose publication time has passed.
    pub fn due(now: DateTime<Utc>) -> Self {
        Self {
            published: Some(false),
            due_before: Some(now),
            ..Default::default()
        }
    }

    pub fn by_author(mut self, author_id: i64) -> Self {
        self.author_id = Some(author_id);
        self
    }
}
