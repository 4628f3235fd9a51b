//! Persistence operations used by the message dispatcher.
//!
//! All functions are synchronous over the shared connection and are meant
//! to be called from `tokio::task::spawn_blocking`.

pub mod groups;
pub mod messages;

pub type StoreResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;
