//! Bounded background work submitted by the request path.
//!
//! Jobs are spread over a fixed set of lanes, each a bounded channel drained by one task. The
//! lane is picked from the job's author, so all jobs for one author run in submission order.
//! Submitting never waits: a full lane drops the job.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::preloader::FeedPreloader;
use crate::infra::lock::mutex_lock;
use crate::config::DispatchSettings;
use crate::domain::events::LifecycleEvent;
use crate::domain::types::UserId;
use crate::events::{EventBus, partition_for, publish_lifecycle};
use crate::infra::telemetry::METRIC_BACKGROUND_DROPPED;
use crate::queue::{WarmTask, WorkQueue};

const SOURCE: &str = "application::background";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundJob {
    /// Append a warm task for the author's friends.
    EnqueueWarm(UserId),
    /// Publish a lifecycle event to the bus.
    Publish(LifecycleEvent),
    /// Rebuild one user's own feed after a read-path miss.
    WarmFeed(UserId),
}

impl BackgroundJob {
    pub fn kind(&self) -> &'static str {
        match self {
            BackgroundJob::EnqueueWarm(_) => "enqueue_warm",
            BackgroundJob::Publish(_) => "publish",
            BackgroundJob::WarmFeed(_) => "warm_feed",
        }
    }

    fn lane_key(&self) -> UserId {
        match self {
            BackgroundJob::EnqueueWarm(author) => *author,
            BackgroundJob::Publish(event) => event.author_id,
            BackgroundJob::WarmFeed(user) => *user,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub lanes: usize,
    pub lane_capacity: usize,
    pub enqueue_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            lane_capacity: 1024,
            enqueue_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&DispatchSettings> for DispatchConfig {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            lanes: settings.lanes.get(),
            lane_capacity: settings.lane_capacity.get(),
            enqueue_timeout: settings.enqueue_timeout,
            publish_timeout: settings.publish_timeout,
        }
    }
}

/// Executes jobs against the queue, the bus and the preloader.
pub struct JobRunner {
    queue: Arc<dyn WorkQueue>,
    bus: Arc<dyn EventBus>,
    preloader: FeedPreloader,
    enqueue_timeout: Duration,
    publish_timeout: Duration,
}

impl JobRunner {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        bus: Arc<dyn EventBus>,
        preloader: FeedPreloader,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            queue,
            bus,
            preloader,
            enqueue_timeout: config.enqueue_timeout,
            publish_timeout: config.publish_timeout,
        }
    }

    /// Runs one job. Failures are logged; nothing is retried.
    pub async fn run(&self, job: BackgroundJob) {
        match job {
            BackgroundJob::EnqueueWarm(author_id) => {
                let task = WarmTask::new(author_id);
                match tokio::time::timeout(self.enqueue_timeout, self.queue.push(&task)).await {
                    Ok(Ok(entry_id)) => debug!(%author_id, %entry_id, "Warm task enqueued"),
                    Ok(Err(err)) => warn!(%author_id, error = %err, "Warm task enqueue failed"),
                    Err(_) => warn!(
                        %author_id,
                        timeout_ms = self.enqueue_timeout.as_millis() as u64,
                        "Warm task enqueue timed out"
                    ),
                }
            }
            BackgroundJob::Publish(event) => {
                let publish = publish_lifecycle(self.bus.as_ref(), &event);
                match tokio::time::timeout(self.publish_timeout, publish).await {
                    Ok(Ok(entry_id)) => debug!(
                        author_id = %event.author_id,
                        post_id = %event.post_id,
                        action = event.action.as_str(),
                        %entry_id,
                        "Lifecycle event published"
                    ),
                    Ok(Err(err)) => warn!(
                        author_id = %event.author_id,
                        post_id = %event.post_id,
                        error = %err,
                        "Lifecycle event publish failed"
                    ),
                    Err(_) => warn!(
                        author_id = %event.author_id,
                        post_id = %event.post_id,
                        timeout_ms = self.publish_timeout.as_millis() as u64,
                        "Lifecycle event publish timed out"
                    ),
                }
            }
            BackgroundJob::WarmFeed(user_id) => {
                if let Err(err) = self.preloader.warm_feed(user_id).await {
                    warn!(%user_id, error = %err, "Background feed warm failed");
                }
            }
        }
    }
}

/// Cloneable handle to the lanes. Dropping handles does not stop the lanes; call
/// [`BackgroundDispatcher::shutdown`].
#[derive(Clone)]
pub struct BackgroundDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    senders: Mutex<Option<Vec<mpsc::Sender<BackgroundJob>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundDispatcher {
    /// Spawns one draining task per lane on the current runtime.
    pub fn start(runner: JobRunner, config: &DispatchConfig) -> Self {
        let runner = Arc::new(runner);
        let lanes = config.lanes.max(1);
        let capacity = config.lane_capacity.max(1);

        let mut senders = Vec::with_capacity(lanes);
        let mut handles = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let (tx, mut rx) = mpsc::channel::<BackgroundJob>(capacity);
            let runner = runner.clone();
            handles.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    runner.run(job).await;
                }
                debug!(lane, "Background lane drained");
            }));
            senders.push(tx);
        }

        info!(lanes, capacity, "Background dispatcher started");
        Self {
            inner: Arc::new(Inner {
                senders: Mutex::new(Some(senders)),
                handles: Mutex::new(handles),
            }),
        }
    }

    /// Queues `job` without waiting. Returns false when the job was dropped.
    pub fn submit(&self, job: BackgroundJob) -> bool {
        let kind = job.kind();
        let guard = mutex_lock(&self.inner.senders, SOURCE, "submit");
        let Some(senders) = guard.as_ref() else {
            drop(guard);
            counter!(METRIC_BACKGROUND_DROPPED, "kind" => kind).increment(1);
            warn!(kind, "Background job dropped: dispatcher is shut down");
            return false;
        };

        let lane = partition_for(&job.lane_key().to_string(), senders.len() as u32) as usize;
        let Some(sender) = senders.get(lane) else {
            return false;
        };
        match sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                counter!(METRIC_BACKGROUND_DROPPED, "kind" => kind).increment(1);
                warn!(kind, lane, author_id = %job.lane_key(), "Background lane full; job dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                counter!(METRIC_BACKGROUND_DROPPED, "kind" => kind).increment(1);
                warn!(kind, lane, "Background lane closed; job dropped");
                false
            }
        }
    }

    /// Stops accepting jobs and lets the lanes drain until `deadline`. Lanes still busy at the
    /// deadline are aborted. Returns true when everything drained in time.
    pub async fn shutdown(&self, deadline: Instant) -> bool {
        let senders = mutex_lock(&self.inner.senders, SOURCE, "shutdown").take();
        drop(senders);

        let handles = std::mem::take(&mut *mutex_lock(&self.inner.handles, SOURCE, "shutdown"));
        let mut drained = true;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "Background lane ended abnormally");
                }
                Err(_) => {
                    drained = false;
                    handle.abort();
                }
            }
        }

        if drained {
            info!("Background dispatcher drained");
        } else {
            warn!("Background dispatcher shutdown deadline passed; remaining jobs abandoned");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::FakeGraph;
    use crate::cache::{CacheConfig, FeedCache, MemoryCacheStore};
    use crate::domain::types::{PostAction, PostId};
    use crate::events::MemoryEventBus;
    use crate::queue::MemoryWorkQueue;

    struct Harness {
        queue: MemoryWorkQueue,
        bus: MemoryEventBus,
        preloader: FeedPreloader,
    }

    fn harness(graph: &Arc<FakeGraph>) -> Harness {
        let config = CacheConfig::default();
        let cache = FeedCache::new(Arc::new(MemoryCacheStore::new(&config)), config);
        Harness {
            queue: MemoryWorkQueue::new("cache_workers"),
            bus: MemoryEventBus::new(4),
            preloader: FeedPreloader::new(graph.clone(), graph.clone(), cache),
        }
    }

    fn dispatcher(harness: &Harness, config: &DispatchConfig) -> BackgroundDispatcher {
        let runner = JobRunner::new(
            Arc::new(harness.queue.clone()),
            Arc::new(harness.bus.clone()),
            harness.preloader.clone(),
            config,
        );
        BackgroundDispatcher::start(runner, config)
    }

    #[tokio::test]
    async fn jobs_run_and_shutdown_drains() {
        let graph = Arc::new(FakeGraph::default());
        let harness = harness(&graph);
        let dispatcher = dispatcher(&harness, &DispatchConfig::default());

        let event = LifecycleEvent::new(
            PostId::new("p1"),
            UserId::new(3),
            PostAction::Create,
            Some("hi".into()),
        );
        assert!(dispatcher.submit(BackgroundJob::EnqueueWarm(UserId::new(3))));
        assert!(dispatcher.submit(BackgroundJob::Publish(event)));
        assert!(dispatcher.submit(BackgroundJob::WarmFeed(UserId::new(5))));

        let drained = dispatcher
            .shutdown(Instant::now() + Duration::from_secs(5))
            .await;
        assert!(drained);
        assert_eq!(harness.queue.backlog_len(), 1);
        let published: usize = (0..4).map(|p| harness.bus.partition_len(p)).sum();
        assert_eq!(published, 1);
        assert!(harness.preloader.cache().get_feed(UserId::new(5)).await.is_ok());
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_dropped() {
        let graph = Arc::new(FakeGraph::default());
        let harness = harness(&graph);
        let dispatcher = dispatcher(&harness, &DispatchConfig::default());

        dispatcher
            .shutdown(Instant::now() + Duration::from_secs(1))
            .await;
        assert!(!dispatcher.submit(BackgroundJob::EnqueueWarm(UserId::new(1))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_lane_drops_instead_of_waiting() {
        let graph = Arc::new(FakeGraph::default());
        let harness = harness(&graph);
        let config = DispatchConfig {
            lanes: 1,
            lane_capacity: 2,
            ..DispatchConfig::default()
        };
        let dispatcher = dispatcher(&harness, &config);

        // The lane task cannot run until this test yields, so the channel fills up.
        let accepted: Vec<bool> = (0..4)
            .map(|_| dispatcher.submit(BackgroundJob::EnqueueWarm(UserId::new(1))))
            .collect();
        assert_eq!(accepted, vec![true, true, false, false]);

        dispatcher
            .shutdown(Instant::now() + Duration::from_secs(5))
            .await;
        assert_eq!(harness.queue.backlog_len(), 2);
    }

    #[tokio::test]
    async fn one_authors_jobs_keep_submission_order() {
        let graph = Arc::new(FakeGraph::default());
        let harness = harness(&graph);
        let dispatcher = dispatcher(&harness, &DispatchConfig::default());
        let mut subscription = harness.bus.subscribe("g", "c").await.expect("subscribe");

        for (index, action) in [PostAction::Create, PostAction::Update, PostAction::Delete]
            .into_iter()
            .enumerate()
        {
            let event = LifecycleEvent::new(
                PostId::new(format!("p{index}")),
                UserId::new(7),
                action,
                Some("t".into()),
            );
            assert!(dispatcher.submit(BackgroundJob::Publish(event)));
        }
        dispatcher
            .shutdown(Instant::now() + Duration::from_secs(5))
            .await;

        let batch = subscription
            .next_batch(10, Duration::from_millis(10))
            .await
            .expect("batch");
        let actions: Vec<PostAction> = batch
            .iter()
            .map(|env| {
                serde_json::from_slice::<LifecycleEvent>(&env.payload)
                    .expect("event")
                    .action
            })
            .collect();
        assert_eq!(
            actions,
            vec![PostAction::Create, PostAction::Update, PostAction::Delete]
        );
    }
}
