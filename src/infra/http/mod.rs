mod api;
mod auth;
mod middleware;
mod ws;

pub use api::{ApiState, build_api_router};
pub use auth::{AuthenticatedUser, UserIdHeader};
pub use middleware::RequestContext;

use std::sync::Arc;

use axum::extract::{FromRef, State};
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, middleware as axum_middleware};
use sqlx::Error as SqlxError;

use crate::application::error::ErrorReport;
use crate::infra::db::PostgresRepositories;
use crate::realtime::ConnectionRegistry;

use self::middleware::{log_responses, set_request_context};

pub const FEED_UPDATES_PATH: &str = "/ws/post/feed/posted";

#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<ConnectionRegistry>,
    pub user_id_header: HeaderName,
    /// Present when the process talks to Postgres; enables `/_health/db`.
    pub db: Option<Arc<PostgresRepositories>>,
}

impl FromRef<HttpState> for UserIdHeader {
    fn from_ref(state: &HttpState) -> Self {
        UserIdHeader(state.user_id_header.clone())
    }
}

/// Live-update socket and health probes, plus the JSON API under `/api/v1` when given.
pub fn build_router(state: HttpState, api: Option<ApiState>) -> Router {
    let mut router = Router::new()
        .route(FEED_UPDATES_PATH, get(ws::feed_updates))
        .route("/healthz", get(healthz))
        .route("/_health/db", get(db_health))
        .with_state(state);

    if let Some(api) = api {
        router = router.nest("/api/v1", build_api_router(api));
    }

    router
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn db_health(State(state): State<HttpState>) -> Response {
    match state.db {
        Some(db) => db_health_response(db.health_check().await),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn db_health_response(result: Result<(), SqlxError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn router() -> Router {
        build_router(
            HttpState {
                registry: Arc::new(ConnectionRegistry::new(Duration::from_secs(1))),
                user_id_header: HeaderName::from_static("x-user-id"),
                db: None,
            },
            None,
        )
    }

    async fn status_of(request: Request<Body>) -> StatusCode {
        router()
            .oneshot(request)
            .await
            .expect("router responds")
            .status()
    }

    #[tokio::test]
    async fn healthz_is_no_content() {
        let request = Request::get("/healthz").body(Body::empty()).expect("request");
        assert_eq!(status_of(request).await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn db_health_without_database_is_no_content() {
        let request = Request::get("/_health/db").body(Body::empty()).expect("request");
        assert_eq!(status_of(request).await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn websocket_without_user_header_is_unauthorized() {
        let request = Request::get(FEED_UPDATES_PATH)
            .body(Body::empty())
            .expect("request");
        assert_eq!(status_of(request).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn websocket_with_garbage_user_header_is_unauthorized() {
        let request = Request::get(FEED_UPDATES_PATH)
            .header("x-user-id", "alice")
            .body(Body::empty())
            .expect("request");
        assert_eq!(status_of(request).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn authenticated_plain_request_fails_upgrade_not_auth() {
        let request = Request::get(FEED_UPDATES_PATH)
            .header("x-user-id", "42")
            .body(Body::empty())
            .expect("request");
        let status = status_of(request).await;
        assert_ne!(status, StatusCode::UNAUTHORIZED);
        assert!(status.is_client_error());
    }
}
