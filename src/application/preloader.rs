//! Recomputes cached feeds after an author's posts change.

use std::sync::Arc;

use metrics::histogram;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::application::repos::{FeedRepo, FriendsRepo, RepoError};
use crate::cache::{CacheError, FeedCache};
use crate::domain::entities::FEED_SNAPSHOT_LIMIT;
use crate::domain::types::UserId;
use crate::infra::telemetry::METRIC_WARM_MS;

#[derive(Debug, Error)]
pub enum WarmError {
    #[error("friend lookup for author {author_id} failed: {source}")]
    Friends {
        author_id: UserId,
        #[source]
        source: RepoError,
    },
    #[error("feed query for user {user_id} failed: {source}")]
    Feed {
        user_id: UserId,
        #[source]
        source: RepoError,
    },
    #[error("cache write for user {user_id} failed: {source}")]
    Cache {
        user_id: UserId,
        #[source]
        source: CacheError,
    },
}

#[derive(Clone)]
pub struct FeedPreloader {
    friends: Arc<dyn FriendsRepo>,
    feeds: Arc<dyn FeedRepo>,
    cache: FeedCache,
}

impl FeedPreloader {
    pub fn new(friends: Arc<dyn FriendsRepo>, feeds: Arc<dyn FeedRepo>, cache: FeedCache) -> Self {
        Self {
            friends,
            feeds,
            cache,
        }
    }

    pub fn cache(&self) -> &FeedCache {
        &self.cache
    }

    /// Rebuilds the feed of every user who sees `author_id`'s posts.
    ///
    /// Returns how many feeds were written. The first failing friend aborts the pass; feeds
    /// written before it stay written.
    #[instrument(skip(self), fields(author_id = %author_id))]
    pub async fn warm(&self, author_id: UserId) -> Result<usize, WarmError> {
        if !self.cache.is_enabled() {
            debug!("Cache disabled; warm skipped");
            return Ok(0);
        }

        let started = Instant::now();
        let friend_ids = self
            .friends
            .friend_ids(author_id)
            .await
            .map_err(|source| WarmError::Friends { author_id, source })?;

        for friend_id in &friend_ids {
            self.write_feed(*friend_id).await?;
        }

        let elapsed = started.elapsed();
        histogram!(METRIC_WARM_MS).record(elapsed.as_secs_f64() * 1000.0);
        info!(
            friends = friend_ids.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Feeds warmed"
        );
        Ok(friend_ids.len())
    }

    /// Rebuilds one user's own feed snapshot.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn warm_feed(&self, user_id: UserId) -> Result<(), WarmError> {
        if !self.cache.is_enabled() {
            return Ok(());
        }
        self.write_feed(user_id).await
    }

    async fn write_feed(&self, user_id: UserId) -> Result<(), WarmError> {
        let snapshot = self
            .feeds
            .feed(user_id, 0, FEED_SNAPSHOT_LIMIT)
            .await
            .map_err(|source| WarmError::Feed { user_id, source })?;
        self.cache
            .set_feed(user_id, &snapshot)
            .await
            .map_err(|source| WarmError::Cache { user_id, source })?;
        debug!(%user_id, posts = snapshot.len(), "Feed snapshot cached");
        Ok(())
    }
}
