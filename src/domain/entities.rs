//! Domain entities mirrored from persistent storage.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::types::{PostId, UserId};

/// A post row as read from the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: PostId,
    pub author_id: UserId,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Posts of a user's friends, newest first, in the shape stored under `user:<id>:feed`.
pub type FeedSnapshot = Vec<PostRecord>;

/// Upper bound on the number of posts kept in one cached feed.
pub const FEED_SNAPSHOT_LIMIT: u32 = 1000;
