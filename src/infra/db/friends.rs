use async_trait::async_trait;

use crate::application::repos::{FriendsRepo, RepoError};
use crate::domain::types::UserId;

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl FriendsRepo for PostgresRepositories {
    async fn friend_ids(&self, author_id: UserId) -> Result<Vec<UserId>, RepoError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT user_id::BIGINT FROM friends WHERE friend_id = $1 ORDER BY user_id",
        )
        .bind(author_id.get())
        .fetch_all(self.pool())
        .await
        .map(|ids| ids.into_iter().map(UserId::new).collect())
        .map_err(map_sqlx_error)
    }
}
