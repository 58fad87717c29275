//! Cache storage abstraction and the JSON facade the pipeline talks to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::domain::entities::FeedSnapshot;
use crate::domain::types::UserId;

use super::config::CacheConfig;
use super::keys::{email_key, feed_key, namespaced};

#[derive(Debug, Error)]
pub enum CacheError {
    /// The key is absent or expired. A control-flow signal, not a failure.
    #[error("cache miss")]
    Miss,
    #[error("cached value for `{key}` could not be decoded: {message}")]
    Decode { key: String, message: String },
    #[error("value for `{key}` could not be encoded: {message}")]
    Encode { key: String, message: String },
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl CacheError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss)
    }
}

/// Byte-level key/value store with per-entry TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Single atomic write. `ttl = None` keeps the entry until deleted.
    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<(), CacheError>;

    /// Returns `CacheError::Miss` when the key is absent or expired.
    async fn get_raw(&self, key: &str) -> Result<Vec<u8>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Atomically reports whether `key` exists and, if not, creates it without a TTL.
    async fn check_and_mark(&self, key: &str) -> Result<bool, CacheError>;

    fn backend_name(&self) -> &'static str;
}

/// JSON-encoding cache over a [`CacheStore`], applying the key namespace.
#[derive(Clone)]
pub struct FeedCache {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
}

impl FeedCache {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let full_key = namespaced(&self.config.namespace, key);
        let bytes = serde_json::to_vec(value).map_err(|err| CacheError::Encode {
            key: key.to_string(),
            message: err.to_string(),
        })?;
        self.store.set_raw(&full_key, bytes, Some(ttl)).await?;
        debug!(key, ttl_secs = ttl.as_secs(), "Cache SET");
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, CacheError> {
        let full_key = namespaced(&self.config.namespace, key);
        let bytes = self.store.get_raw(&full_key).await?;
        serde_json::from_slice(&bytes).map_err(|err| CacheError::Decode {
            key: key.to_string(),
            message: err.to_string(),
        })
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let full_key = namespaced(&self.config.namespace, key);
        self.store.delete(&full_key).await
    }

    pub async fn set_feed(&self, user_id: UserId, snapshot: &FeedSnapshot) -> Result<(), CacheError> {
        self.set(&feed_key(user_id), snapshot, self.config.feed_ttl)
            .await
    }

    pub async fn get_feed(&self, user_id: UserId) -> Result<FeedSnapshot, CacheError> {
        self.get(&feed_key(user_id)).await
    }

    pub async fn delete_feed(&self, user_id: UserId) -> Result<(), CacheError> {
        self.delete(&feed_key(user_id)).await
    }

    /// Returns true when the email was already marked; otherwise marks it.
    pub async fn has_email(&self, email: &str) -> Result<bool, CacheError> {
        self.store.check_and_mark(&email_key(email)).await
    }

    /// Removes the dedupe marker, e.g. after a failed registration.
    pub async fn delete_email(&self, email: &str) -> Result<(), CacheError> {
        self.store.delete(&email_key(email)).await
    }
}
