//! Redis Streams work queue (`XADD` / `XREADGROUP` / `XACK` / `XAUTOCLAIM`).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamAutoClaimReply, StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use tracing::{debug, info};

use crate::infra::redis_client::{is_busy_group, is_missing_group, stream_fields};

use super::{QueueConsumer, QueueEntry, QueueError, WarmTask, WorkQueue};

/// Start id for `XAUTOCLAIM` scans and the group's initial cursor.
const STREAM_START: &str = "0-0";

/// Approximate cap on stream entries; older entries are trimmed on push.
const DEFAULT_MAX_LEN: usize = 100_000;

#[derive(Clone)]
pub struct RedisWorkQueue {
    client: redis::Client,
    connection: ConnectionManager,
    stream: String,
    group: String,
    max_len: usize,
}

impl std::fmt::Debug for RedisWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWorkQueue")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("max_len", &self.max_len)
            .finish()
    }
}

impl RedisWorkQueue {
    pub fn new(
        client: redis::Client,
        connection: ConnectionManager,
        stream: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            client,
            connection,
            stream: stream.into(),
            group: group.into(),
            max_len: DEFAULT_MAX_LEN,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }
}

fn backend(op: &str, err: RedisError) -> QueueError {
    QueueError::backend(format!("Redis {op} failed: {err}"))
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn push(&self, task: &WarmTask) -> Result<String, QueueError> {
        let mut conn = self.connection.clone();
        let fields = task.to_fields();
        let id: String = conn
            .xadd_maxlen(
                &self.stream,
                StreamMaxlen::Approx(self.max_len),
                "*",
                fields.as_slice(),
            )
            .await
            .map_err(|err| backend("XADD", err))?;
        debug!(stream = %self.stream, entry_id = %id, author_id = %task.author_id, "Warm task appended");
        Ok(id)
    }

    async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        let created: Result<(), RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Consumer group created");
                Ok(())
            }
            Err(err) if is_busy_group(&err) => Ok(()),
            Err(err) => Err(backend("XGROUP CREATE", err)),
        }
    }

    async fn consumer(&self, name: &str) -> Result<Box<dyn QueueConsumer>, QueueError> {
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| backend("connect", err))?;
        Ok(Box::new(RedisConsumer {
            connection,
            stream: self.stream.clone(),
            group: self.group.clone(),
            name: name.to_string(),
            claim_cursor: STREAM_START.to_string(),
        }))
    }
}

/// Owns its connection so a blocking `XREADGROUP` never delays other commands.
struct RedisConsumer {
    connection: MultiplexedConnection,
    stream: String,
    group: String,
    name: String,
    claim_cursor: String,
}

impl RedisConsumer {
    fn group_error(&self, op: &str, err: RedisError) -> QueueError {
        if is_missing_group(&err) {
            QueueError::MissingGroup {
                group: self.group.clone(),
            }
        } else {
            backend(op, err)
        }
    }
}

#[async_trait]
impl QueueConsumer for RedisConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_group(
        &mut self,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX).max(1);
        let options = StreamReadOptions::default()
            .group(&self.group, &self.name)
            .count(count)
            .block(block_ms);

        let reply: Option<StreamReadReply> = self
            .connection
            .xread_options(&[&self.stream], &[">"], &options)
            .await
            .map_err(|err| self.group_error("XREADGROUP", err))?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .iter()
                    .flat_map(|key| key.ids.iter())
                    .map(|entry| QueueEntry {
                        id: entry.id.clone(),
                        fields: stream_fields(entry),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn claim_stale(
        &mut self,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.name)
            .arg(min_idle_ms)
            .arg(&self.claim_cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.connection)
            .await
            .map_err(|err| self.group_error("XAUTOCLAIM", err))?;

        self.claim_cursor = reply.next_stream_id.clone();

        // Pending entries whose payload was trimmed from the stream can never be processed.
        if !reply.deleted_ids.is_empty() {
            let _: i64 = self
                .connection
                .xack(&self.stream, &self.group, reply.deleted_ids.as_slice())
                .await
                .map_err(|err| backend("XACK", err))?;
        }

        Ok(reply
            .claimed
            .iter()
            .map(|entry| QueueEntry {
                id: entry.id.clone(),
                fields: stream_fields(entry),
            })
            .collect())
    }

    async fn ack(&mut self, entry_id: &str) -> Result<(), QueueError> {
        let _: i64 = self
            .connection
            .xack(&self.stream, &self.group, &[entry_id])
            .await
            .map_err(|err| self.group_error("XACK", err))?;
        Ok(())
    }
}
