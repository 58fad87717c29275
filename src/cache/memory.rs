//! In-process cache backend: bounded LRU with lazy expiry and a periodic sweep.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::infra::lock::mutex_lock;

use super::config::CacheConfig;
use super::store::{CacheError, CacheStore};

const SOURCE: &str = "cache::memory";

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

pub struct MemoryCacheStore {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryCacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(config.memory_capacity_non_zero())),
        }
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "sweep");
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired cache entries");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        mutex_lock(&self.entries, SOURCE, "set").put(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                Err(CacheError::Miss)
            }
            None => Err(CacheError::Miss),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        mutex_lock(&self.entries, SOURCE, "delete").pop(key);
        Ok(())
    }

    async fn check_and_mark(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "check_and_mark");
        if entries.get(key).is_some_and(|entry| !entry.is_expired(now)) {
            return Ok(true);
        }
        entries.put(
            key.to_string(),
            Entry {
                value: b"1".to_vec(),
                expires_at: None,
            },
        );
        Ok(false)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
