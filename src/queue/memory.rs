//! In-process work queue with the same delivery semantics as the stream-backed one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::infra::lock::mutex_lock;

use super::{QueueConsumer, QueueEntry, QueueError, WarmTask, WorkQueue};

const SOURCE: &str = "queue::memory";

#[derive(Clone)]
pub struct MemoryWorkQueue {
    shared: Arc<Shared>,
}

struct Shared {
    group: String,
    state: Mutex<State>,
    appended: Notify,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    /// Entries still referenced by the group cursor or pending list. `log[0]` has seq `base`.
    log: VecDeque<HashMap<String, String>>,
    base: u64,
    group: Option<GroupState>,
}

struct GroupState {
    cursor: u64,
    pending: BTreeMap<u64, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

impl State {
    fn entry(&self, seq: u64) -> Option<QueueEntry> {
        let index = usize::try_from(seq.checked_sub(self.base)?).ok()?;
        self.log.get(index).map(|fields| QueueEntry {
            id: entry_id(seq),
            fields: fields.clone(),
        })
    }

    /// Drops log entries that can never be delivered again.
    fn compact(&mut self) {
        let Some(group) = self.group.as_ref() else {
            return;
        };
        let oldest_pending = group.pending.keys().next().copied().unwrap_or(u64::MAX);
        let keep_from = group.cursor.min(oldest_pending);
        while self.base < keep_from && !self.log.is_empty() {
            self.log.pop_front();
            self.base += 1;
        }
    }
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_entry_id(id: &str) -> Option<u64> {
    id.split_once('-')
        .map_or(id, |(seq, _)| seq)
        .parse()
        .ok()
}

impl MemoryWorkQueue {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                group: group.into(),
                state: Mutex::new(State::default()),
                appended: Notify::new(),
            }),
        }
    }

    /// Number of entries delivered but not yet acknowledged.
    pub fn pending_len(&self) -> usize {
        let state = mutex_lock(&self.shared.state, SOURCE, "pending_len");
        state.group.as_ref().map_or(0, |group| group.pending.len())
    }

    /// How many times the entry has been handed to a consumer.
    pub fn delivery_count(&self, entry_id: &str) -> Option<u32> {
        let seq = parse_entry_id(entry_id)?;
        let state = mutex_lock(&self.shared.state, SOURCE, "delivery_count");
        state
            .group
            .as_ref()
            .and_then(|group| group.pending.get(&seq))
            .map(|pending| pending.deliveries)
    }

    /// Consumer currently holding the entry.
    pub fn pending_owner(&self, entry_id: &str) -> Option<String> {
        let seq = parse_entry_id(entry_id)?;
        let state = mutex_lock(&self.shared.state, SOURCE, "pending_owner");
        state
            .group
            .as_ref()
            .and_then(|group| group.pending.get(&seq))
            .map(|pending| pending.consumer.clone())
    }

    /// Entries appended but not yet delivered to the group.
    pub fn backlog_len(&self) -> usize {
        let state = mutex_lock(&self.shared.state, SOURCE, "backlog_len");
        let cursor = state.group.as_ref().map_or(state.base, |group| group.cursor);
        usize::try_from(state.next_seq.saturating_sub(cursor)).unwrap_or(usize::MAX)
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn push(&self, task: &WarmTask) -> Result<String, QueueError> {
        let fields = task
            .to_fields()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        let id = {
            let mut state = mutex_lock(&self.shared.state, SOURCE, "push");
            let seq = state.next_seq;
            state.next_seq += 1;
            state.log.push_back(fields);
            entry_id(seq)
        };
        self.shared.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut state = mutex_lock(&self.shared.state, SOURCE, "ensure_group");
        if state.group.is_none() {
            let cursor = state.base;
            state.group = Some(GroupState {
                cursor,
                pending: BTreeMap::new(),
            });
        }
        Ok(())
    }

    async fn consumer(&self, name: &str) -> Result<Box<dyn QueueConsumer>, QueueError> {
        Ok(Box::new(MemoryConsumer {
            shared: self.shared.clone(),
            name: name.to_string(),
        }))
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    name: String,
}

impl MemoryConsumer {
    fn take_new(&self, count: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let mut state = mutex_lock(&self.shared.state, SOURCE, "read_group");
        let next_seq = state.next_seq;
        let Some(mut group) = state.group.take() else {
            return Err(QueueError::MissingGroup {
                group: self.shared.group.clone(),
            });
        };

        let now = Instant::now();
        let mut batch = Vec::new();
        while batch.len() < count && group.cursor < next_seq {
            let seq = group.cursor;
            group.cursor += 1;
            if let Some(entry) = state.entry(seq) {
                group.pending.insert(
                    seq,
                    Pending {
                        consumer: self.name.clone(),
                        delivered_at: now,
                        deliveries: 1,
                    },
                );
                batch.push(entry);
            }
        }
        state.group = Some(group);
        Ok(batch)
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_group(
        &mut self,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_new(count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_stale(
        &mut self,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let mut state = mutex_lock(&self.shared.state, SOURCE, "claim_stale");
        let Some(mut group) = state.group.take() else {
            return Err(QueueError::MissingGroup {
                group: self.shared.group.clone(),
            });
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (seq, pending) in group.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            if let Some(entry) = state.entry(*seq) {
                pending.consumer = self.name.clone();
                pending.delivered_at = now;
                pending.deliveries += 1;
                claimed.push(entry);
            }
        }
        state.group = Some(group);
        Ok(claimed)
    }

    async fn ack(&mut self, entry_id: &str) -> Result<(), QueueError> {
        let seq = parse_entry_id(entry_id)
            .ok_or_else(|| QueueError::malformed(entry_id, "not a queue entry id"))?;
        let mut state = mutex_lock(&self.shared.state, SOURCE, "ack");
        match state.group.as_mut() {
            Some(group) => {
                group.pending.remove(&seq);
            }
            None => {
                return Err(QueueError::MissingGroup {
                    group: self.shared.group.clone(),
                });
            }
        }
        state.compact();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::UserId;

    async fn queue_with_group() -> MemoryWorkQueue {
        let queue = MemoryWorkQueue::new("cache_workers");
        queue.ensure_group().await.expect("group");
        queue
    }

    #[tokio::test]
    async fn reading_without_group_fails() {
        let queue = MemoryWorkQueue::new("cache_workers");
        let mut consumer = queue.consumer("w0").await.expect("consumer");
        let err = consumer
            .read_group(10, Duration::from_millis(1))
            .await
            .expect_err("missing group");
        assert!(matches!(err, QueueError::MissingGroup { .. }));
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent_and_keeps_cursor() {
        let queue = queue_with_group().await;
        queue.push(&WarmTask::new(UserId::new(1))).await.expect("push");
        let mut consumer = queue.consumer("w0").await.expect("consumer");
        let batch = consumer
            .read_group(10, Duration::from_millis(1))
            .await
            .expect("read");
        assert_eq!(batch.len(), 1);

        queue.ensure_group().await.expect("second ensure");
        let again = consumer
            .read_group(10, Duration::from_millis(1))
            .await
            .expect("read");
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn entries_pushed_before_group_creation_are_delivered() {
        let queue = MemoryWorkQueue::new("cache_workers");
        queue.push(&WarmTask::new(UserId::new(5))).await.expect("push");
        queue.ensure_group().await.expect("group");

        let mut consumer = queue.consumer("w0").await.expect("consumer");
        let batch = consumer
            .read_group(10, Duration::from_millis(1))
            .await
            .expect("read");
        assert_eq!(batch[0].task().expect("task").author_id, UserId::new(5));
    }

    #[tokio::test]
    async fn delivers_in_append_order_and_respects_batch_size() {
        let queue = queue_with_group().await;
        for id in 1..=5 {
            queue.push(&WarmTask::new(UserId::new(id))).await.expect("push");
        }

        let mut consumer = queue.consumer("w0").await.expect("consumer");
        let first = consumer
            .read_group(3, Duration::from_millis(1))
            .await
            .expect("read");
        let second = consumer
            .read_group(3, Duration::from_millis(1))
            .await
            .expect("read");

        let ids: Vec<i64> = first
            .iter()
            .chain(second.iter())
            .map(|entry| entry.task().expect("task").author_id.get())
            .collect();
        assert_eq!(first.len(), 3);
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(queue.pending_len(), 5);
    }

    #[tokio::test]
    async fn consumers_in_one_group_never_share_new_entries() {
        let queue = queue_with_group().await;
        for id in 1..=4 {
            queue.push(&WarmTask::new(UserId::new(id))).await.expect("push");
        }
        let mut a = queue.consumer("a").await.expect("consumer");
        let mut b = queue.consumer("b").await.expect("consumer");

        let from_a = a.read_group(2, Duration::from_millis(1)).await.expect("a");
        let from_b = b.read_group(10, Duration::from_millis(1)).await.expect("b");
        assert_eq!(from_a.len(), 2);
        assert_eq!(from_b.len(), 2);
        assert!(from_a.iter().all(|entry| !from_b.contains(entry)));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_wakes_on_push() {
        let queue = queue_with_group().await;
        let mut consumer = queue.consumer("w0").await.expect("consumer");

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            producer
                .push(&WarmTask::new(UserId::new(8)))
                .await
                .expect("push");
        });

        let batch = consumer
            .read_group(10, Duration::from_secs(5))
            .await
            .expect("read");
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_times_out_with_empty_batch() {
        let queue = queue_with_group().await;
        let mut consumer = queue.consumer("w0").await.expect("consumer");
        let started = Instant::now();
        let batch = consumer
            .read_group(10, Duration::from_secs(5))
            .await
            .expect("read");
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_entries_are_claimable_after_idle_timeout() {
        let queue = queue_with_group().await;
        let id = queue.push(&WarmTask::new(UserId::new(3))).await.expect("push");

        let mut crashed = queue.consumer("crashed").await.expect("consumer");
        let delivered = crashed
            .read_group(10, Duration::from_millis(1))
            .await
            .expect("read");
        assert_eq!(delivered.len(), 1);

        let mut survivor = queue.consumer("survivor").await.expect("consumer");
        let early = survivor
            .claim_stale(Duration::from_secs(30), 10)
            .await
            .expect("claim");
        assert!(early.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let claimed = survivor
            .claim_stale(Duration::from_secs(30), 10)
            .await
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(queue.delivery_count(&id), Some(2));
        assert_eq!(queue.pending_owner(&id).as_deref(), Some("survivor"));

        survivor.ack(&id).await.expect("ack");
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn acked_entries_are_compacted_away() {
        let queue = queue_with_group().await;
        for id in 1..=3 {
            queue.push(&WarmTask::new(UserId::new(id))).await.expect("push");
        }
        let mut consumer = queue.consumer("w0").await.expect("consumer");
        let batch = consumer
            .read_group(10, Duration::from_millis(1))
            .await
            .expect("read");
        for entry in &batch {
            consumer.ack(&entry.id).await.expect("ack");
        }

        let state = mutex_lock(&queue.shared.state, SOURCE, "test");
        assert!(state.log.is_empty());
        assert_eq!(state.base, 3);
    }

    #[tokio::test]
    async fn ack_of_garbage_id_is_rejected() {
        let queue = queue_with_group().await;
        let mut consumer = queue.consumer("w0").await.expect("consumer");
        assert!(consumer.ack("nope").await.is_err());
    }
}
