//! In-memory social graph used by the application unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::application::repos::{FeedRepo, FriendsRepo, PostsWriteRepo, RepoError};
use crate::domain::entities::PostRecord;
use crate::domain::types::{PostId, UserId};

#[derive(Default)]
pub(crate) struct FakeGraph {
    state: Mutex<FakeState>,
    feed_calls: AtomicUsize,
}

#[derive(Default)]
struct FakeState {
    /// author -> users whose feed shows the author's posts
    followers: HashMap<UserId, Vec<UserId>>,
    posts: Vec<PostRecord>,
    failing_feeds: HashSet<UserId>,
    failing_friends: bool,
    next_post: i64,
}

impl FakeGraph {
    pub(crate) fn befriend(&self, author: i64, followers: &[i64]) {
        let mut state = self.state.lock().expect("fake graph lock");
        state.followers.insert(
            UserId::new(author),
            followers.iter().copied().map(UserId::new).collect(),
        );
    }

    pub(crate) fn fail_feed_for(&self, user: i64) {
        let mut state = self.state.lock().expect("fake graph lock");
        state.failing_feeds.insert(UserId::new(user));
    }

    pub(crate) fn fail_friend_lookups(&self) {
        self.state.lock().expect("fake graph lock").failing_friends = true;
    }

    pub(crate) fn feed_calls(&self) -> usize {
        self.feed_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn seed_post(&self, author: i64, text: &str) -> PostRecord {
        let mut state = self.state.lock().expect("fake graph lock");
        state.next_post += 1;
        let at = OffsetDateTime::UNIX_EPOCH + TimeDuration::seconds(state.next_post);
        let record = PostRecord {
            id: PostId::new(format!("post-{}", state.next_post)),
            author_id: UserId::new(author),
            text: text.to_string(),
            created_at: at,
            updated_at: at,
        };
        state.posts.push(record.clone());
        record
    }
}

#[async_trait]
impl FriendsRepo for FakeGraph {
    async fn friend_ids(&self, author_id: UserId) -> Result<Vec<UserId>, RepoError> {
        let state = self.state.lock().expect("fake graph lock");
        if state.failing_friends {
            return Err(RepoError::from_persistence("friends table unavailable"));
        }
        Ok(state.followers.get(&author_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl FeedRepo for FakeGraph {
    async fn feed(
        &self,
        user_id: UserId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<PostRecord>, RepoError> {
        self.feed_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().expect("fake graph lock");
        if state.failing_feeds.contains(&user_id) {
            return Err(RepoError::Timeout);
        }
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
        posts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_str().cmp(a.id.as_str()))
        });
        Ok(posts
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[async_trait]
impl PostsWriteRepo for FakeGraph {
    async fn create_post(&self, author_id: UserId, text: &str) -> Result<PostRecord, RepoError> {
        Ok(self.seed_post(author_id.get(), text))
    }

    async fn update_post(
        &self,
        author_id: UserId,
        post_id: &PostId,
        text: &str,
    ) -> Result<PostRecord, RepoError> {
        let mut state = self.state.lock().expect("fake graph lock");
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
        let mut state = self.state.lock().expect("fake graph lock");
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
