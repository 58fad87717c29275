//! Feed cache.
//!
//! Snapshots are JSON-encoded and stored under `<namespace>user:<id>:feed` with a TTL. Two
//! backends are available:
//!
//! - **redis**: shared between processes, `SET .. PX` / `GET` / `DEL` plus a Lua check-and-set
//!   for registration dedupe markers.
//! - **memory**: bounded LRU with lazy expiry and a periodic sweep, for tests and
//!   single-process deployments.

mod config;
mod keys;
mod memory;
mod redis_store;
mod store;

pub use config::CacheConfig;
pub use keys::{HAS_EMAIL_PREFIX, email_key, feed_key, namespaced};
pub use memory::MemoryCacheStore;
pub use redis_store::RedisCacheStore;
pub use store::{CacheError, CacheStore, FeedCache};
