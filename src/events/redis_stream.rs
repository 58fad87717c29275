//! Redis Streams event bus: one stream per partition, `<topic>:<n>`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use tracing::{debug, info, warn};

use crate::infra::redis_client::{is_busy_group, is_missing_group};

use super::partition::{partition_for, partition_stream};
use super::{EventBus, EventBusError, EventEnvelope, EventSubscription};

const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";

/// Approximate cap on entries kept per partition stream.
const DEFAULT_MAX_LEN: usize = 100_000;

#[derive(Clone)]
pub struct RedisEventBus {
    client: redis::Client,
    connection: ConnectionManager,
    topic: String,
    partitions: u32,
    max_len: usize,
}

impl std::fmt::Debug for RedisEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventBus")
            .field("topic", &self.topic)
            .field("partitions", &self.partitions)
            .field("max_len", &self.max_len)
            .finish()
    }
}

impl RedisEventBus {
    pub fn new(
        client: redis::Client,
        connection: ConnectionManager,
        topic: impl Into<String>,
        partitions: u32,
    ) -> Self {
        Self {
            client,
            connection,
            topic: topic.into(),
            partitions: partitions.max(1),
            max_len: DEFAULT_MAX_LEN,
        }
    }

    /// Trims each partition stream to roughly `max_len` entries on publish.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    fn streams(&self) -> Vec<String> {
        (0..self.partitions)
            .map(|partition| partition_stream(&self.topic, partition))
            .collect()
    }
}

fn backend(op: &str, err: RedisError) -> EventBusError {
    EventBusError::backend(format!("Redis {op} failed: {err}"))
}

#[async_trait]
impl EventBus for RedisEventBus {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn publish(&self, key: &str, payload: &[u8]) -> Result<String, EventBusError> {
        let partition = partition_for(key, self.partitions);
        let stream = partition_stream(&self.topic, partition);
        let mut conn = self.connection.clone();
        let id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(KEY_FIELD)
            .arg(key)
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend("XADD", err))?;
        debug!(%stream, entry_id = %id, key, "Event published");
        Ok(id)
    }

    async fn subscribe(
        &self,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn EventSubscription>, EventBusError> {
        let streams = self.streams();
        let mut conn = self.connection.clone();
        for stream in &streams {
            let created: Result<(), RedisError> =
                conn.xgroup_create_mkstream(stream, group, "$").await;
            match created {
                Ok(()) => info!(%stream, group, "Event consumer group created"),
                Err(err) if is_busy_group(&err) => {}
                Err(err) => return Err(backend("XGROUP CREATE", err)),
            }
        }

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| backend("connect", err))?;

        Ok(Box::new(RedisSubscription {
            connection,
            streams,
            group: group.to_string(),
            consumer: consumer.to_string(),
            recovering: true,
        }))
    }
}

struct RedisSubscription {
    connection: MultiplexedConnection,
    streams: Vec<String>,
    group: String,
    consumer: String,
    /// While true, re-reads this consumer's own unacknowledged history before new events.
    recovering: bool,
}

impl RedisSubscription {
    fn envelopes(&self, reply: StreamReadReply) -> Vec<EventEnvelope> {
        let mut envelopes = Vec::new();
        for stream in reply.keys {
            let Some(partition) = self.streams.iter().position(|name| *name == stream.key) else {
                warn!(stream = %stream.key, "Entries from unexpected stream ignored");
                continue;
            };
            for entry in stream.ids {
                envelopes.push(EventEnvelope {
                    partition: partition as u32,
                    key: entry.get::<String>(KEY_FIELD).unwrap_or_default(),
                    payload: entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default(),
                    id: entry.id,
                });
            }
        }
        envelopes
    }
}

#[async_trait]
impl EventSubscription for RedisSubscription {
    async fn next_batch(
        &mut self,
        max: usize,
        block: Duration,
    ) -> Result<Vec<EventEnvelope>, EventBusError> {
        let start = if self.recovering { "0" } else { ">" };
        let ids = vec![start; self.streams.len()];
        let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX).max(1);
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max)
            .block(block_ms);

        let reply: Option<StreamReadReply> = self
            .connection
            .xread_options(self.streams.as_slice(), ids.as_slice(), &options)
            .await
            .map_err(|err| {
                if is_missing_group(&err) {
                    EventBusError::MissingGroup {
                        group: self.group.clone(),
                    }
                } else {
                    backend("XREADGROUP", err)
                }
            })?;

        let envelopes = reply.map(|reply| self.envelopes(reply)).unwrap_or_default();
        if self.recovering && envelopes.is_empty() {
            self.recovering = false;
        }
        Ok(envelopes)
    }

    async fn commit(&mut self, envelope: &EventEnvelope) -> Result<(), EventBusError> {
        let stream = self
            .streams
            .get(envelope.partition as usize)
            .ok_or_else(|| EventBusError::backend(format!("no partition {}", envelope.partition)))?;
        let _: i64 = self
            .connection
            .xack(stream, &self.group, &[&envelope.id])
            .await
            .map_err(|err| backend("XACK", err))?;
        Ok(())
    }
}
