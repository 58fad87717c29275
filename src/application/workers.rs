//! Long-lived consumers draining the warm-task queue.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::application::preloader::FeedPreloader;
use crate::config::{QueueSettings, WorkerSettings};
use crate::infra::telemetry::METRIC_QUEUE_ENTRIES;
use crate::queue::{QueueConsumer, QueueEntry, QueueError, WorkQueue};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub count: u32,
    pub consumer_prefix: String,
    pub batch_size: usize,
    pub block: Duration,
    pub claim_idle: Duration,
    pub error_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            count: 8,
            consumer_prefix: "cache-worker".to_string(),
            batch_size: 10,
            block: Duration::from_secs(5),
            claim_idle: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_settings(workers: &WorkerSettings, queue: &QueueSettings) -> Self {
        Self {
            count: workers.count.get(),
            consumer_prefix: workers.consumer_prefix.clone(),
            batch_size: queue.batch_size.get(),
            block: queue.block,
            claim_idle: queue.claim_idle,
            error_backoff: queue.error_backoff,
        }
    }

    pub fn consumer_name(&self, index: u32) -> String {
        format!("{}-{index}", self.consumer_prefix)
    }
}

/// What happened to one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Warmed,
    WarmFailed,
    Poison,
}

impl EntryOutcome {
    fn as_str(self) -> &'static str {
        match self {
            EntryOutcome::Warmed => "warmed",
            EntryOutcome::WarmFailed => "warm_failed",
            EntryOutcome::Poison => "poison",
        }
    }
}

pub struct WorkerPool {
    queue: Arc<dyn WorkQueue>,
    preloader: FeedPreloader,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn WorkQueue>, preloader: FeedPreloader, config: WorkerPoolConfig) -> Self {
        Self {
            queue,
            preloader,
            config,
        }
    }

    /// Ensures the consumer group exists, then spawns `count` consumer loops. The loops exit
    /// only when `cancel` fires.
    pub async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        self.queue.ensure_group().await?;

        let count = self.config.count.max(1);
        let mut handles = Vec::with_capacity(count as usize);
        for index in 0..count {
            let name = self.config.consumer_name(index);
            let consumer = self.queue.consumer(&name).await?;
            let worker = Worker {
                consumer,
                queue: self.queue.clone(),
                preloader: self.preloader.clone(),
                config: self.config.clone(),
            };
            let span = info_span!("worker", worker = %name);
            handles.push(tokio::spawn(worker.run(cancel.clone()).instrument(span)));
        }

        info!(workers = count, "Worker pool started");
        Ok(handles)
    }
}

struct Worker {
    consumer: Box<dyn QueueConsumer>,
    queue: Arc<dyn WorkQueue>,
    preloader: FeedPreloader,
    config: WorkerPoolConfig,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        debug!("Worker loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = self.next_batch() => batch,
            };

            match batch {
                Ok(entries) => {
                    for entry in entries {
                        self.process(&entry).await;
                    }
                }
                Err(err) => {
                    counter!(METRIC_QUEUE_ENTRIES, "outcome" => "read_error").increment(1);
                    warn!(error = %err, "Queue read failed; backing off");
                    if matches!(err, QueueError::MissingGroup { .. })
                        && let Err(err) = self.queue.ensure_group().await
                    {
                        warn!(error = %err, "Recreating consumer group failed");
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }
        debug!("Worker loop stopped");
    }

    /// Stale entries abandoned by other consumers first, then new ones.
    async fn next_batch(&mut self) -> Result<Vec<QueueEntry>, QueueError> {
        let claimed = self
            .consumer
            .claim_stale(self.config.claim_idle, self.config.batch_size)
            .await?;
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed stale entries");
            return Ok(claimed);
        }
        self.consumer
            .read_group(self.config.batch_size, self.config.block)
            .await
    }

    async fn process(&mut self, entry: &QueueEntry) -> EntryOutcome {
        let outcome = match entry.task() {
            Err(err) => {
                warn!(entry_id = %entry.id, error = %err, "Dropping malformed warm task");
                EntryOutcome::Poison
            }
            Ok(task) => match self.preloader.warm(task.author_id).await {
                Ok(feeds) => {
                    debug!(entry_id = %entry.id, author_id = %task.author_id, feeds, "Warm task done");
                    EntryOutcome::Warmed
                }
                Err(err) => {
                    warn!(
                        entry_id = %entry.id,
                        author_id = %task.author_id,
                        error = %err,
                        "Warm task failed"
                    );
                    EntryOutcome::WarmFailed
                }
            },
        };

        counter!(METRIC_QUEUE_ENTRIES, "outcome" => outcome.as_str()).increment(1);
        if let Err(err) = self.consumer.ack(&entry.id).await {
            warn!(entry_id = %entry.id, error = %err, "Ack failed; entry stays pending");
        }
        outcome
    }
}
