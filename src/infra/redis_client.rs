//! Redis connection bootstrap and helpers shared by the stream adapters.

use std::collections::HashMap;

use redis::RedisError;
use redis::aio::ConnectionManager;
use redis::streams::StreamId;
use tracing::info;

use super::error::InfraError;

/// A client (for dedicated per-consumer connections) and a shared auto-reconnecting manager.
#[derive(Clone)]
pub struct RedisHandles {
    pub client: redis::Client,
    pub manager: ConnectionManager,
}

pub async fn connect(url: &str) -> Result<RedisHandles, InfraError> {
    let client = redis::Client::open(url)
        .map_err(|e| InfraError::redis(format!("invalid Redis URL: {e}")))?;
    let manager = ConnectionManager::new(client.clone())
        .await
        .map_err(|e| InfraError::redis(format!("failed to connect to Redis: {e}")))?;
    info!(url = %redact_url(url), "Redis connected");
    Ok(RedisHandles { client, manager })
}

/// Redact credentials from a Redis URL for logging.
pub fn redact_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@')
        && let Some(colon_pos) = url[..at_pos].rfind(':')
        && colon_pos > url.find("://").map_or(0, |scheme| scheme + 2)
    {
        return format!("{}***{}", &url[..=colon_pos], &url[at_pos..]);
    }
    url.to_string()
}

pub(crate) fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
}

pub(crate) fn is_missing_group(err: &RedisError) -> bool {
    err.code() == Some("NOGROUP")
}

/// Flattens a stream entry's field map into strings; non-string values are dropped.
pub(crate) fn stream_fields(entry: &StreamId) -> HashMap<String, String> {
    entry
        .map
        .iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|value| (key.clone(), value))
        })
        .collect()
}
