//! In-process event bus: one log per partition and per-group cursors.
//!
//! Offsets are absolute. Each partition log drops the prefix every group has committed, so a
//! long-running process holds only what some group still has to read.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::infra::lock::mutex_lock;

use super::partition::partition_for;
use super::{EventBus, EventBusError, EventEnvelope, EventSubscription};

const SOURCE: &str = "events::memory";

#[derive(Clone)]
pub struct MemoryEventBus {
    shared: Arc<Shared>,
}

struct Shared {
    partitions: u32,
    state: Mutex<State>,
    appended: Notify,
}

struct State {
    logs: Vec<PartitionLog>,
    groups: HashMap<String, GroupCursors>,
}

#[derive(Default, Clone)]
struct PartitionLog {
    /// Offset of `entries[0]`.
    base: u64,
    entries: VecDeque<(String, Vec<u8>)>,
}

impl PartitionLog {
    fn end(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&(String, Vec<u8>)> {
        let index = usize::try_from(offset.checked_sub(self.base)?).ok()?;
        self.entries.get(index)
    }

    fn trim_below(&mut self, offset: u64) {
        while self.base < offset && self.entries.pop_front().is_some() {
            self.base += 1;
        }
    }
}

struct GroupCursors {
    /// Next offset to hand out, per partition.
    delivered: Vec<u64>,
    /// Highest committed offset + 1, per partition.
    committed: Vec<u64>,
}

impl State {
    /// Drops entries on `partition` that every group has committed.
    fn compact(&mut self, partition: usize) {
        let keep_from = self
            .groups
            .values()
            .filter_map(|cursors| cursors.committed.get(partition).copied())
            .min();
        if let (Some(keep_from), Some(log)) = (keep_from, self.logs.get_mut(partition)) {
            log.trim_below(keep_from);
        }
    }
}

impl MemoryEventBus {
    pub fn new(partitions: u32) -> Self {
        let partitions = partitions.max(1);
        let count = partitions as usize;
        Self {
            shared: Arc::new(Shared {
                partitions,
                state: Mutex::new(State {
                    logs: vec![PartitionLog::default(); count],
                    groups: HashMap::new(),
                }),
                appended: Notify::new(),
            }),
        }
    }

    /// Events still retained on one partition.
    pub fn partition_len(&self, partition: u32) -> usize {
        let state = mutex_lock(&self.shared.state, SOURCE, "partition_len");
        state
            .logs
            .get(partition as usize)
            .map_or(0, |log| log.entries.len())
    }

    /// Offset after the last event `group` committed on `partition`.
    pub fn committed(&self, group: &str, partition: u32) -> Option<u64> {
        let state = mutex_lock(&self.shared.state, SOURCE, "committed");
        state
            .groups
            .get(group)
            .and_then(|cursors| cursors.committed.get(partition as usize).copied())
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    fn partitions(&self) -> u32 {
        self.shared.partitions
    }

    async fn publish(&self, key: &str, payload: &[u8]) -> Result<String, EventBusError> {
        let partition = partition_for(key, self.shared.partitions);
        let offset = {
            let mut state = mutex_lock(&self.shared.state, SOURCE, "publish");
            let log = state
                .logs
                .get_mut(partition as usize)
                .ok_or_else(|| EventBusError::backend(format!("no partition {partition}")))?;
            log.entries.push_back((key.to_string(), payload.to_vec()));
            log.end() - 1
        };
        self.shared.appended.notify_waiters();
        Ok(offset.to_string())
    }

    async fn subscribe(
        &self,
        group: &str,
        _consumer: &str,
    ) -> Result<Box<dyn EventSubscription>, EventBusError> {
        {
            let mut state = mutex_lock(&self.shared.state, SOURCE, "subscribe");
            if !state.groups.contains_key(group) {
                let ends: Vec<u64> = state.logs.iter().map(PartitionLog::end).collect();
                state.groups.insert(
                    group.to_string(),
                    GroupCursors {
                        delivered: ends.clone(),
                        committed: ends,
                    },
                );
            }
        }
        Ok(Box::new(MemorySubscription {
            shared: self.shared.clone(),
            group: group.to_string(),
            next_start: 0,
        }))
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    group: String,
    /// Partition the next batch starts from; rotates so one busy partition cannot fill every batch.
    next_start: usize,
}

impl MemorySubscription {
    fn take(&mut self, max: usize) -> Vec<EventEnvelope> {
        let mut state = mutex_lock(&self.shared.state, SOURCE, "next_batch");
        let State { logs, groups } = &mut *state;
        let Some(cursors) = groups.get_mut(&self.group) else {
            return Vec::new();
        };

        let count = logs.len();
        let start = self.next_start % count.max(1);
        self.next_start = (start + 1) % count.max(1);

        let mut batch = Vec::new();
        for partition in (0..count).map(|step| (start + step) % count) {
            let log = &logs[partition];
            let cursor = &mut cursors.delivered[partition];
            // A cursor behind the retained prefix only happens for a group that never commits.
            *cursor = (*cursor).max(log.base);
            while batch.len() < max {
                let Some((key, payload)) = log.get(*cursor) else {
                    break;
                };
                batch.push(EventEnvelope {
                    partition: partition as u32,
                    id: cursor.to_string(),
                    key: key.clone(),
                    payload: payload.clone(),
                });
                *cursor += 1;
            }
        }
        batch
    }
}

#[async_trait]
impl EventSubscription for MemorySubscription {
    async fn next_batch(
        &mut self,
        max: usize,
        block: Duration,
    ) -> Result<Vec<EventEnvelope>, EventBusError> {
        let deadline = Instant::now() + block;
        loop {
            let shared = self.shared.clone();
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take(max);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, envelope: &EventEnvelope) -> Result<(), EventBusError> {
        let offset: u64 = envelope
            .id
            .parse()
            .map_err(|_| EventBusError::backend(format!("bad offset `{}`", envelope.id)))?;
        let partition = envelope.partition as usize;
        let mut state = mutex_lock(&self.shared.state, SOURCE, "commit");
        let Some(committed) = state
            .groups
            .get_mut(&self.group)
            .and_then(|cursors| cursors.committed.get_mut(partition))
        else {
            return Ok(());
        };
        *committed = (*committed).max(offset + 1);
        state.compact(partition);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_with_same_key_arrive_in_publish_order() {
        let bus = MemoryEventBus::new(8);
        let mut sub = bus.subscribe("g", "c").await.expect("subscribe");

        bus.publish("7", b"create").await.expect("publish");
        bus.publish("9", b"other").await.expect("publish");
        bus.publish("7", b"update").await.expect("publish");

        let batch = sub
            .next_batch(10, Duration::from_millis(1))
            .await
            .expect("batch");
        let for_seven: Vec<&[u8]> = batch
            .iter()
            .filter(|env| env.key == "7")
            .map(|env| env.payload.as_slice())
            .collect();
        assert_eq!(for_seven, vec![b"create".as_slice(), b"update".as_slice()]);
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn new_group_starts_at_current_end() {
        let bus = MemoryEventBus::new(2);
        bus.publish("1", b"old").await.expect("publish");

        let mut sub = bus.subscribe("late", "c").await.expect("subscribe");
        let empty = sub
            .next_batch(10, Duration::from_millis(1))
            .await
            .expect("batch");
        assert!(empty.is_empty());

        bus.publish("1", b"new").await.expect("publish");
        let batch = sub
            .next_batch(10, Duration::from_millis(1))
            .await
            .expect("batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"new");
    }

    #[tokio::test]
    async fn groups_each_see_every_event() {
        let bus = MemoryEventBus::new(4);
        let mut a = bus.subscribe("a", "c").await.expect("subscribe");
        let mut b = bus.subscribe("b", "c").await.expect("subscribe");
        bus.publish("3", b"x").await.expect("publish");

        assert_eq!(
            a.next_batch(10, Duration::from_millis(1))
                .await
                .expect("a")
                .len(),
            1
        );
        assert_eq!(
            b.next_batch(10, Duration::from_millis(1))
                .await
                .expect("b")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn commit_advances_group_offset() {
        let bus = MemoryEventBus::new(1);
        let mut sub = bus.subscribe("g", "c").await.expect("subscribe");
        bus.publish("1", b"a").await.expect("publish");
        bus.publish("1", b"b").await.expect("publish");

        let batch = sub
            .next_batch(10, Duration::from_millis(1))
            .await
            .expect("batch");
        assert_eq!(bus.committed("g", 0), Some(0));
        for envelope in &batch {
            sub.commit(envelope).await.expect("commit");
        }
        assert_eq!(bus.committed("g", 0), Some(2));
    }

    #[tokio::test]
    async fn committed_prefix_is_dropped_from_the_log() {
        let bus = MemoryEventBus::new(1);
        let mut sub = bus.subscribe("g", "c").await.expect("subscribe");

        for n in 0..10_000 {
            bus.publish("1", format!("post-{n}").as_bytes())
                .await
                .expect("publish");
            let batch = sub
                .next_batch(16, Duration::from_millis(1))
                .await
                .expect("batch");
            for envelope in &batch {
                sub.commit(envelope).await.expect("commit");
            }
        }

        assert_eq!(bus.committed("g", 0), Some(10_000));
        assert_eq!(bus.partition_len(0), 0);
    }

    #[tokio::test]
    async fn slowest_group_holds_back_compaction() {
        let bus = MemoryEventBus::new(1);
        let mut fast = bus.subscribe("fast", "c").await.expect("subscribe");
        let mut slow = bus.subscribe("slow", "c").await.expect("subscribe");
        for payload in [b"a", b"b", b"c"] {
            bus.publish("1", payload).await.expect("publish");
        }

        for envelope in &fast
            .next_batch(10, Duration::from_millis(1))
            .await
            .expect("fast")
        {
            fast.commit(envelope).await.expect("commit");
        }
        assert_eq!(bus.partition_len(0), 3);

        let pending = slow
            .next_batch(1, Duration::from_millis(1))
            .await
            .expect("slow");
        slow.commit(&pending[0]).await.expect("commit");
        assert_eq!(bus.partition_len(0), 2);

        let rest = slow
            .next_batch(10, Duration::from_millis(1))
            .await
            .expect("slow");
        let ids: Vec<&str> = rest.iter().map(|env| env.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn busy_partition_does_not_starve_the_others() {
        let bus = MemoryEventBus::new(2);
        let hot = (0..)
            .map(|n: u32| n.to_string())
            .find(|key| partition_for(key, 2) == 0)
            .expect("key on partition 0");
        let cold = (0..)
            .map(|n: u32| n.to_string())
            .find(|key| partition_for(key, 2) == 1)
            .expect("key on partition 1");

        let mut sub = bus.subscribe("g", "c").await.expect("subscribe");
        bus.publish(&cold, b"quiet").await.expect("publish");

        let mut delivered = false;
        for _ in 0..4 {
            bus.publish(&hot, b"busy").await.expect("publish");
            bus.publish(&hot, b"busy").await.expect("publish");
            let batch = sub
                .next_batch(2, Duration::from_millis(1))
                .await
                .expect("batch");
            if batch.iter().any(|env| env.key == cold) {
                delivered = true;
                break;
            }
        }
        assert!(delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bus_times_out() {
        let bus = MemoryEventBus::new(2);
        let mut sub = bus.subscribe("g", "c").await.expect("subscribe");
        let batch = sub
            .next_batch(10, Duration::from_secs(2))
            .await
            .expect("batch");
        assert!(batch.is_empty());
    }
}
