//! Pipeline services: warming, reading, fan-out and mutation follow-ups.

pub mod background;
pub mod coordinator;
pub mod error;
pub mod feed;
pub mod notifier;
pub mod preloader;
pub mod repos;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;
