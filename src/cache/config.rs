//! Cache configuration.
//!
//! Controls the feed cache TTL, key namespace and in-process backend sizing.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_FEED_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_NAMESPACE: &str = "warm";
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When false, reads bypass the cache and warm writes are skipped.
    pub enabled: bool,
    /// Lifetime of a cached feed snapshot.
    pub feed_ttl: Duration,
    /// Prefix prepended verbatim to logical keys.
    pub namespace: String,
    /// Maximum entries held by the in-process backend.
    pub memory_capacity: usize,
    /// Period of the in-process expiry sweep.
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            feed_ttl: Duration::from_secs(DEFAULT_FEED_TTL_SECS),
            namespace: DEFAULT_NAMESPACE.to_string(),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            feed_ttl: settings.feed_ttl,
            namespace: settings.namespace.clone(),
            memory_capacity: settings.memory_capacity.get(),
            cleanup_interval: settings.cleanup_interval,
        }
    }
}

impl CacheConfig {
    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
