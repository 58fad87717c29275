//! JSON routes for feed reads and post mutations, mounted under `/api/v1`.

use axum::extract::{FromRef, Path, Query, State};
use axum::http::HeaderName;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::application::coordinator::PostMutationCoordinator;
use crate::application::error::AppError;
use crate::application::feed::FeedReader;
use crate::domain::entities::PostRecord;
use crate::domain::types::PostId;

use super::auth::{AuthenticatedUser, UserIdHeader};

const DEFAULT_PAGE_LIMIT: u32 = 10;

#[derive(Clone)]
pub struct ApiState {
    pub feed: FeedReader,
    pub posts: PostMutationCoordinator,
    pub user_id_header: HeaderName,
}

impl FromRef<ApiState> for UserIdHeader {
    fn from_ref(state: &ApiState) -> Self {
        UserIdHeader(state.user_id_header.clone())
    }
}

pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/post/feed", get(feed))
        .route("/post/create", post(create_post))
        .route("/post/update", put(update_post))
        .route("/post/delete/{id}", put(delete_post))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct FeedQuery {
    offset: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CreatePostRequest {
    text: String,
}

#[derive(Debug, Deserialize)]
struct UpdatePostRequest {
    id: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct PostIdResponse {
    id: PostId,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: &'static str,
}

async fn feed(
    AuthenticatedUser(user_id): AuthenticatedUser,
    State(state): State<ApiState>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Vec<PostRecord>>, AppError> {
    let page = state
        .feed
        .read(
            user_id,
            query.offset.unwrap_or(0),
            query.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        )
        .await?;
    Ok(Json(page))
}

async fn create_post(
    AuthenticatedUser(user_id): AuthenticatedUser,
    State(state): State<ApiState>,
    Json(body): Json<CreatePostRequest>,
) -> Result<Json<PostIdResponse>, AppError> {
    let id = state.posts.create_post(user_id, &body.text).await?;
    Ok(Json(PostIdResponse { id }))
}

async fn update_post(
    AuthenticatedUser(user_id): AuthenticatedUser,
    State(state): State<ApiState>,
    Json(body): Json<UpdatePostRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    state
        .posts
        .update_post(user_id, &PostId::new(body.id), &body.text)
        .await?;
    Ok(Json(MessageResponse {
        message: "Post updated successfully",
    }))
}

async fn delete_post(
    AuthenticatedUser(user_id): AuthenticatedUser,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    state.posts.delete_post(user_id, &PostId::new(id)).await?;
    Ok(Json(MessageResponse {
        message: "Post deleted successfully",
    }))
}
