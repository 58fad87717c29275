//! Feed read path: cached snapshot first, source of truth on any cache trouble.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::application::background::{BackgroundDispatcher, BackgroundJob};
use crate::application::error::AppError;
use crate::application::repos::FeedRepo;
use crate::cache::{CacheError, FeedCache};
use crate::domain::entities::PostRecord;
use crate::domain::types::UserId;
use crate::infra::telemetry::{METRIC_CACHE_HIT, METRIC_CACHE_MISS};

/// Largest page a caller may request.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// `snapshot[offset..min(offset + limit, len)]`, empty when `offset` is past the end.
pub fn paginate(snapshot: &[PostRecord], offset: u32, limit: u32) -> Vec<PostRecord> {
    let len = snapshot.len();
    let start = usize::try_from(offset).unwrap_or(usize::MAX);
    if start >= len {
        return Vec::new();
    }
    let end = start.saturating_add(limit as usize).min(len);
    snapshot[start..end].to_vec()
}

#[derive(Clone)]
pub struct FeedReader {
    cache: FeedCache,
    feeds: Arc<dyn FeedRepo>,
    dispatcher: BackgroundDispatcher,
}

impl FeedReader {
    pub fn new(cache: FeedCache, feeds: Arc<dyn FeedRepo>, dispatcher: BackgroundDispatcher) -> Self {
        Self {
            cache,
            feeds,
            dispatcher,
        }
    }

    /// One page of `user_id`'s feed.
    ///
    /// Never fails because of the cache: a miss, a backend error or an undecodable entry all
    /// fall back to the repository and schedule a background rebuild of the user's snapshot.
    pub async fn read(
        &self,
        user_id: UserId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<PostRecord>, AppError> {
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(AppError::validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }

        if !self.cache.is_enabled() {
            return Ok(self.feeds.feed(user_id, offset, limit).await?);
        }

        match self.cache.get_feed(user_id).await {
            Ok(snapshot) => {
                counter!(METRIC_CACHE_HIT).increment(1);
                debug!(%user_id, offset, limit, cached = snapshot.len(), "Feed served from cache");
                return Ok(paginate(&snapshot, offset, limit));
            }
            Err(CacheError::Miss) => {
                debug!(%user_id, "Feed cache miss");
            }
            Err(err @ CacheError::Decode { .. }) => {
                warn!(%user_id, error = %err, "Dropping undecodable feed entry");
                if let Err(delete_err) = self.cache.delete_feed(user_id).await {
                    warn!(%user_id, error = %delete_err, "Failed to delete undecodable feed entry");
                }
            }
            Err(err) => {
                warn!(%user_id, error = %err, "Feed cache unavailable; reading source");
            }
        }

        counter!(METRIC_CACHE_MISS).increment(1);
        let page = self.feeds.feed(user_id, offset, limit).await?;
        self.dispatcher.submit(BackgroundJob::WarmFeed(user_id));
        Ok(page)
    }
}
