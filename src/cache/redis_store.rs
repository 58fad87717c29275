//! Redis cache backend.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::store::{CacheError, CacheStore};

/// Marks the key and reports whether it was already present, in one round trip.
const CHECK_AND_MARK_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 1
end
redis.call("SET", KEYS[1], 1)
return 0
"#;

#[derive(Clone)]
pub struct RedisCacheStore {
    connection: ConnectionManager,
    check_and_mark: Script,
}

impl std::fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisCacheStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            check_and_mark: Script::new(CHECK_AND_MARK_SCRIPT),
        }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::backend(format!("Redis SET failed: {e}")))
    }

    async fn get_raw(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(format!("Redis GET failed: {e}")))?;

        match value {
            Some(bytes) => {
                debug!(key, "Cache HIT");
                Ok(bytes)
            }
            None => {
                debug!(key, "Cache MISS");
                Err(CacheError::Miss)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::backend(format!("Redis DEL failed: {e}")))
    }

    async fn check_and_mark(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let existed: i64 = self
            .check_and_mark
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(format!("Redis check-and-mark script failed: {e}")))?;
        Ok(existed == 1)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
