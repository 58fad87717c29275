//! Identity asserted by the upstream authentication layer.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderName, StatusCode};

use crate::application::error::HttpError;
use crate::domain::types::UserId;

const SOURCE: &str = "infra::http::auth::authenticate";

/// Header carrying the caller's user id.
#[derive(Debug, Clone)]
pub struct UserIdHeader(pub HeaderName);

#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub UserId);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
    UserIdHeader: FromRef<S>,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let UserIdHeader(header) = UserIdHeader::from_ref(state);
        let value = parts.headers.get(&header).ok_or_else(|| {
            HttpError::new(
                SOURCE,
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
                format!("header `{header}` is missing"),
            )
        })?;

        value
            .to_str()
            .ok()
            .and_then(|raw| raw.parse::<UserId>().ok())
            .map(AuthenticatedUser)
            .ok_or_else(|| {
                HttpError::new(
                    SOURCE,
                    StatusCode::UNAUTHORIZED,
                    "Unauthorized",
                    format!("header `{header}` is not a user id"),
                )
            })
    }
}
