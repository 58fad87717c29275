//! Feed cache warming and live update fan-out.
//!
//! Post mutations enqueue a warm task and publish a lifecycle event. Workers drain the queue
//! and rebuild the cached feeds of the author's friends; the notifier drains the event bus and
//! pushes updates to friends holding a live WebSocket connection.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod events;
pub mod infra;
pub mod queue;
pub mod realtime;
