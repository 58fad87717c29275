//! Durable warm-task log with consumer groups.
//!
//! Producers append [`WarmTask`]s; consumers in one group each receive distinct entries and
//! must acknowledge every entry individually. Unacknowledged entries stay pending and can be
//! claimed by another consumer once idle long enough.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis_stream;
mod task;

pub use memory::MemoryWorkQueue;
pub use redis_stream::RedisWorkQueue;
pub use task::{QueueEntry, USER_ID_FIELD, WarmTask};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("consumer group `{group}` does not exist")]
    MissingGroup { group: String },
    #[error("entry `{entry_id}` is malformed: {message}")]
    Malformed { entry_id: String, message: String },
}

impl QueueError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn malformed(entry_id: &str, message: impl Into<String>) -> Self {
        Self::Malformed {
            entry_id: entry_id.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Appends a task and returns its entry id once durably recorded.
    async fn push(&self, task: &WarmTask) -> Result<String, QueueError>;

    /// Creates the log and consumer group if missing. Idempotent.
    async fn ensure_group(&self) -> Result<(), QueueError>;

    /// Opens a named consumer in the group.
    async fn consumer(&self, name: &str) -> Result<Box<dyn QueueConsumer>, QueueError>;
}

#[async_trait]
pub trait QueueConsumer: Send {
    fn name(&self) -> &str;

    /// Reads up to `count` never-delivered entries, waiting at most `block` for the first one.
    /// Returns an empty batch on timeout.
    async fn read_group(
        &mut self,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Takes over up to `count` pending entries idle for at least `min_idle`.
    async fn claim_stale(
        &mut self,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    async fn ack(&mut self, entry_id: &str) -> Result<(), QueueError>;
}
