//! Result sinks: where streamed output and per-request status live.
//!
//! A sink is the single source of truth a polling consumer reads. Writers
//! call `initialize`, then any number of `append`s, then exactly one of
//! `finalize` or `mark_error`. Status is monotonic: once a request is
//! `Completed` or `Failed` it never changes again.

mod memory;
pub mod redis;

pub use memory::MemorySink;
pub use self::redis::RedisSink;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by result sinks
#[derive(Error, Debug)]
pub enum SinkError {
    /// The backing store failed
    #[error("Sink backend error: {0}")]
    Backend(String),

    /// Metadata could not be encoded or decoded
    #[error("Sink serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The request is already `Completed` or `Failed`
    #[error("Request {0} already reached a terminal status")]
    AlreadyTerminal(Uuid),
}

impl From<::redis::RedisError> for SinkError {
    fn from(err: ::redis::RedisError) -> Self {
        SinkError::Backend(err.to_string())
    }
}

/// Per-request status as observed by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Still streaming, or not known yet
    InProgress,
    /// Finished with its full output
    Completed,
    /// Finished with an error message as content
    Failed,
}

impl RequestStatus {
    /// Whether the status can no longer change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::InProgress)
    }

    /// Wire representation, also used by the Redis sink
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(RequestStatus::InProgress),
            "completed" => Ok(RequestStatus::Completed),
            "failed" | "error" => Ok(RequestStatus::Failed),
            other => Err(SinkError::Backend(format!("unknown status '{other}'"))),
        }
    }
}

/// Metadata recorded when a request completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Time from initialize to the last fragment
    pub processing_time: Duration,
    /// Fragments appended
    pub fragment_count: usize,
    /// Throughput, 0 when no time elapsed
    pub fragments_per_second: f64,
}

impl ResultMetadata {
    /// Metadata with throughput derived from the other two fields
    pub fn new(processing_time: Duration, fragment_count: usize) -> Self {
        let secs = processing_time.as_secs_f64();
        let fragments_per_second = if secs > 0.0 {
            fragment_count as f64 / secs
        } else {
            0.0
        };
        Self {
            processing_time,
            fragment_count,
            fragments_per_second,
        }
    }
}

/// Storage for incremental output and status, keyed by request id
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Start a request with empty content and `InProgress` status.
    ///
    /// Restarting an `InProgress` request clears it; a terminal request is
    /// refused with [`SinkError::AlreadyTerminal`].
    async fn initialize(&self, id: Uuid) -> Result<(), SinkError>;

    /// Append one fragment to the request's content
    async fn append(&self, id: Uuid, fragment: &str) -> Result<(), SinkError>;

    /// Mark the request `Completed` with its metadata
    async fn finalize(&self, id: Uuid, metadata: &ResultMetadata) -> Result<(), SinkError>;

    /// Mark the request `Failed` with a message
    async fn mark_error(&self, id: Uuid, message: &str) -> Result<(), SinkError>;

    /// Current status; unknown ids report `InProgress`
    async fn get_status(&self, id: Uuid) -> Result<RequestStatus, SinkError>;

    /// Content streamed so far, `None` for unknown ids
    async fn get_content(&self, id: Uuid) -> Result<Option<String>, SinkError>;

    /// Release backend resources
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
