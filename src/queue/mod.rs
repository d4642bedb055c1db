//! Optional upstream sources of requests.
//!
//! The manager pulls requests with `fetch`, and `acknowledge`s them once the
//! batch that carried them has finished.

mod memory;
pub mod redis;

pub use memory::MemoryQueue;
pub use self::redis::RedisQueue;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::batch::RequestUnit;

/// Errors raised by upstream queues
#[derive(Error, Debug)]
pub enum QueueError {
    /// The backing store failed
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// A request could not be encoded or decoded
    #[error("Queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The queue was closed
    #[error("Queue is closed")]
    Closed,
}

impl From<::redis::RedisError> for QueueError {
    fn from(err: ::redis::RedisError) -> Self {
        QueueError::Backend(err.to_string())
    }
}

/// A durable or in-process source of pending requests
#[async_trait]
pub trait UpstreamQueue: Send + Sync {
    /// Take up to `max_batch` pending requests, oldest first
    async fn fetch(&self, max_batch: usize) -> Result<Vec<RequestUnit>, QueueError>;

    /// Mark requests as consumed
    async fn acknowledge(&self, ids: &[Uuid]) -> Result<(), QueueError>;

    /// Release resources; later calls fail with [`QueueError::Closed`]
    async fn close(&self) -> Result<(), QueueError>;
}
