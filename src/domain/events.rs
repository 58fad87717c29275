//! Messages that leave the process: lifecycle events on the bus and live pushes to clients.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::types::{PostAction, PostId, UserId};

/// A post lifecycle change, partitioned by author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub post_id: PostId,
    pub author_id: UserId,
    pub action: PostAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
}

impl LifecycleEvent {
    pub fn new(post_id: PostId, author_id: UserId, action: PostAction, text: Option<String>) -> Self {
        let text = match action {
            PostAction::Delete => None,
            _ => text,
        };
        Self {
            post_id,
            author_id,
            action,
            text,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    /// Partition key on the event bus.
    pub fn partition_key(&self) -> String {
        self.author_id.to_string()
    }
}

/// Payload written to a friend's live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivePushMessage {
    #[serde(rename = "postId")]
    pub post_id: PostId,
    #[serde(rename = "postText", default, skip_serializing_if = "Option::is_none")]
    pub post_text: Option<String>,
    pub author_user_id: UserId,
    pub created_at: i64,
}

impl From<&LifecycleEvent> for LivePushMessage {
    fn from(event: &LifecycleEvent) -> Self {
        Self {
            post_id: event.post_id.clone(),
            post_text: event.text.clone(),
            author_user_id: event.author_id,
            created_at: event.timestamp,
        }
    }
}
