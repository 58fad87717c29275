//! Partitioned publish/subscribe for post lifecycle events.
//!
//! A key always maps to the same partition, and each partition is delivered in append order,
//! so events sharing a key are observed in publish order. Nothing is ordered across partitions.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::events::LifecycleEvent;

mod memory;
mod partition;
mod redis_stream;

pub use memory::MemoryEventBus;
pub use partition::{fnv1a, partition_for, partition_stream};
pub use redis_stream::RedisEventBus;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("event bus backend error: {0}")]
    Backend(String),
    #[error("event could not be encoded: {0}")]
    Encode(String),
    /// The broker lost the consumer group; subscribing again recreates it.
    #[error("consumer group `{group}` does not exist")]
    MissingGroup { group: String },
}

impl EventBusError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// One delivered event. `id` identifies it within its partition for commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub partition: u32,
    pub id: String,
    pub key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    fn partitions(&self) -> u32;

    /// Appends `payload` to the partition owning `key`; returns the entry id.
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<String, EventBusError>;

    /// Joins `group` as `consumer`, creating the group at the current end of every partition
    /// if it does not exist yet.
    async fn subscribe(
        &self,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn EventSubscription>, EventBusError>;
}

#[async_trait]
pub trait EventSubscription: Send {
    /// Up to `max` events across all partitions, each partition's events in order.
    /// Returns an empty batch when nothing arrives within `block`.
    async fn next_batch(
        &mut self,
        max: usize,
        block: Duration,
    ) -> Result<Vec<EventEnvelope>, EventBusError>;

    async fn commit(&mut self, envelope: &EventEnvelope) -> Result<(), EventBusError>;
}

/// JSON-encodes `event` and publishes it keyed by author.
pub async fn publish_lifecycle(
    bus: &dyn EventBus,
    event: &LifecycleEvent,
) -> Result<String, EventBusError> {
    let payload =
        serde_json::to_vec(event).map_err(|err| EventBusError::Encode(err.to_string()))?;
    bus.publish(&event.partition_key(), &payload).await
}
