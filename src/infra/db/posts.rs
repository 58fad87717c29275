use async_trait::async_trait;
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::application::repos::{FeedRepo, PostsWriteRepo, RepoError};
use crate::domain::entities::PostRecord;
use crate::domain::types::{PostId, UserId};

use super::{PostgresRepositories, map_sqlx_error};

const POST_COLUMNS: &str = "p.id::TEXT AS id, p.author_id::BIGINT AS author_id, p.text, \
    p.created_at::TIMESTAMPTZ AS created_at, p.updated_at::TIMESTAMPTZ AS updated_at";

#[derive(Debug, FromRow)]
struct PostRow {
    id: String,
    author_id: i64,
    text: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<PostRow> for PostRecord {
    fn from(row: PostRow) -> Self {
        Self {
            id: PostId::new(row.id),
            author_id: UserId::new(row.author_id),
            text: row.text,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl PostgresRepositories {
    /// Distinguishes an unknown post from one owned by someone else.
    async fn ownership_error(&self, post_id: &PostId) -> RepoError {
        let owner = sqlx::query_scalar::<_, i64>(
            "SELECT author_id::BIGINT FROM posts WHERE id = $1::UUID",
        )
        .bind(post_id.as_str())
        .fetch_optional(self.pool())
        .await;

        match owner {
            Ok(Some(_)) => RepoError::NotOwner,
            Ok(None) => RepoError::NotFound,
            Err(err) => map_sqlx_error(err),
        }
    }
}

#[async_trait]
impl FeedRepo for PostgresRepositories {
    async fn feed(
        &self,
        user_id: UserId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<PostRecord>, RepoError> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM posts p \
             JOIN friends f ON p.author_id = f.friend_id \
             WHERE f.user_id = $1 \
             ORDER BY p.created_at DESC, p.id DESC \
             LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, PostRow>(&sql)
            .bind(user_id.get())
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(PostRecord::from).collect())
    }
}

#[async_trait]
impl PostsWriteRepo for PostgresRepositories {
    async fn create_post(&self, author_id: UserId, text: &str) -> Result<PostRecord, RepoError> {
        let now = OffsetDateTime::now_utc();
        let sql = format!(
            "INSERT INTO posts AS p (author_id, text, created_at, updated_at) \
             VALUES ($1, $2, $3, $3) \
             RETURNING {POST_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PostRow>(&sql)
            .bind(author_id.get())
            .bind(text)
            .bind(now)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn update_post(
        &self,
        author_id: UserId,
        post_id: &PostId,
        text: &str,
    ) -> Result<PostRecord, RepoError> {
        let sql = format!(
            "UPDATE posts AS p SET text = $1, updated_at = $2 \
             WHERE p.id = $3::UUID AND p.author_id = $4 \
             RETURNING {POST_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PostRow>(&sql)
            .bind(text)
            .bind(OffsetDateTime::now_utc())
            .bind(post_id.as_str())
            .bind(author_id.get())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.ownership_error(post_id).await),
        }
    }

    async fn delete_post(&self, author_id: UserId, post_id: &PostId) -> Result<(), RepoError> {
        let result = sqlx::query("DELETE FROM posts WHERE id = $1::UUID AND author_id = $2")
            .bind(post_id.as_str())
            .bind(author_id.get())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(self.ownership_error(post_id).await);
        }
        Ok(())
    }
}
