#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use feedwarm::application::background::{BackgroundDispatcher, DispatchConfig, JobRunner};
use feedwarm::application::preloader::FeedPreloader;
use feedwarm::application::repos::{FeedRepo, FriendsRepo, PostsWriteRepo, RepoError};
use feedwarm::cache::{CacheConfig, FeedCache, MemoryCacheStore};
use feedwarm::domain::entities::PostRecord;
use feedwarm::domain::types::{PostId, UserId};
use feedwarm::events::MemoryEventBus;
use feedwarm::queue::MemoryWorkQueue;
use feedwarm::realtime::{PushChannel, PushError};
use time::{Duration as TimeDuration, OffsetDateTime};

/// Friends graph plus post table, newest-first feeds.
#[derive(Default)]
pub struct SocialGraph {
    state: Mutex<GraphState>,
    feed_calls: AtomicUsize,
}

#[derive(Default)]
struct GraphState {
    followers: HashMap<UserId, Vec<UserId>>,
    posts: Vec<PostRecord>,
    next_post: i64,
}

impl SocialGraph {
    pub fn befriend(&self, author: i64, followers: &[i64]) {
        self.state.lock().expect("graph lock").followers.insert(
            UserId::new(author),
            followers.iter().copied().map(UserId::new).collect(),
        );
    }

    pub fn add_post(&self, author: i64, text: &str) -> PostRecord {
        let mut state = self.state.lock().expect("graph lock");
        state.next_post += 1;
        let at = OffsetDateTime::UNIX_EPOCH + TimeDuration::minutes(state.next_post);
        let record = PostRecord {
            id: PostId::new(format!("p{:04}", state.next_post)),
            author_id: UserId::new(author),
            text: text.to_string(),
            created_at: at,
            updated_at: at,
        };
        state.posts.push(record.clone());
        record
    }

    pub fn feed_calls(&self) -> usize {
        self.feed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FriendsRepo for SocialGraph {
    async fn friend_ids(&self, author_id: UserId) -> Result<Vec<UserId>, RepoError> {
        let state = self.state.lock().expect("graph lock");
        Ok(state.followers.get(&author_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl FeedRepo for SocialGraph {
    async fn feed(
        &self,
        user_id: UserId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<PostRecord>, RepoError> {
        self.feed_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().expect("graph lock");
        let mut posts: Vec<PostRecord> = state
            .posts
            .iter()
            .filter(|post| {
                state
                    .followers
                    .get(&post.author_id)
                    .is_some_and(|followers| followers.contains(&user_id))
            })
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(posts
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[async_trait]
impl PostsWriteRepo for SocialGraph {
    async fn create_post(&self, author_id: UserId, text: &str) -> Result<PostRecord, RepoError> {
        Ok(self.add_post(author_id.get(), text))
    }

    async fn update_post(
        &self,
        author_id: UserId,
        post_id: &PostId,
        text: &str,
    ) -> Result<PostRecord, RepoError> {
        let mut state = self.state.lock().expect("graph lock");
        let post = state
            .posts
            .iter_mut()
            .find(|post| &post.id == post_id)
            .ok_or(RepoError::NotFound)?;
        if post.author_id != author_id {
            return Err(RepoError::NotOwner);
        }
        post.text = text.to_string();
        Ok(post.clone())
    }

    async fn delete_post(&self, author_id: UserId, post_id: &PostId) -> Result<(), RepoError> {
        let mut state = self.state.lock().expect("graph lock");
        let index = state
            .posts
            .iter()
            .position(|post| &post.id == post_id)
            .ok_or(RepoError::NotFound)?;
        if state.posts[index].author_id != author_id {
            return Err(RepoError::NotOwner);
        }
        state.posts.remove(index);
        Ok(())
    }
}

/// Live channel that keeps every payload it was handed.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("channel lock").clone()
    }
}

#[async_trait]
impl PushChannel for RecordingChannel {
    async fn send(&self, payload: String) -> Result<(), PushError> {
        self.sent.lock().expect("channel lock").push(payload);
        Ok(())
    }
}

/// Memory-backed pipeline sharing one graph.
pub struct Pipeline {
    pub graph: Arc<SocialGraph>,
    pub store: Arc<MemoryCacheStore>,
    pub cache: FeedCache,
    pub preloader: FeedPreloader,
    pub queue: MemoryWorkQueue,
    pub bus: MemoryEventBus,
    pub dispatcher: BackgroundDispatcher,
}

impl Pipeline {
    pub fn new(cache_config: CacheConfig, partitions: u32) -> Self {
        let graph = Arc::new(SocialGraph::default());
        let store = Arc::new(MemoryCacheStore::new(&cache_config));
        let cache = FeedCache::new(store.clone(), cache_config);
        let preloader = FeedPreloader::new(graph.clone(), graph.clone(), cache.clone());
        let queue = MemoryWorkQueue::new("cache_workers");
        let bus = MemoryEventBus::new(partitions);
        let dispatch = DispatchConfig::default();
        let dispatcher = BackgroundDispatcher::start(
            JobRunner::new(
                Arc::new(queue.clone()),
                Arc::new(bus.clone()),
                preloader.clone(),
                &dispatch,
            ),
            &dispatch,
        );
        Self {
            graph,
            store,
            cache,
            preloader,
            queue,
            bus,
            dispatcher,
        }
    }

    pub async fn drain_background(&self) {
        self.dispatcher
            .shutdown(tokio::time::Instant::now() + Duration::from_secs(5))
            .await;
    }
}

/// Polls `check` every 10ms until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
