//! Infrastructure adapters and runtime bootstrap.

pub mod db;
pub mod error;
pub mod http;
pub(crate) mod lock;
pub mod redis_client;
pub mod telemetry;
