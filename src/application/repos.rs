//! Repository traits describing the source-of-truth collaborators.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::PostRecord;
use crate::domain::types::{PostId, UserId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("caller does not own the resource")]
    NotOwner,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[async_trait]
pub trait FriendsRepo: Send + Sync {
    /// Users whose feeds contain `author_id`'s posts.
    async fn friend_ids(&self, author_id: UserId) -> Result<Vec<UserId>, RepoError>;
}

#[async_trait]
pub trait FeedRepo: Send + Sync {
    /// Posts authored by `user_id`'s friends, newest first.
    async fn feed(
        &self,
        user_id: UserId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<PostRecord>, RepoError>;
}

#[async_trait]
pub trait PostsWriteRepo: Send + Sync {
    async fn create_post(&self, author_id: UserId, text: &str) -> Result<PostRecord, RepoError>;

    /// Fails with `NotFound` for an unknown id and `NotOwner` when `author_id` did not write it.
    async fn update_post(
        &self,
        author_id: UserId,
        post_id: &PostId,
        text: &str,
    ) -> Result<PostRecord, RepoError>;

    async fn delete_post(&self, author_id: UserId, post_id: &PostId) -> Result<(), RepoError>;
}
