//! Requests, batches and the status types shared by the batching modules.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Errors raised when a request is rejected at admission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The prompt is the empty string
    #[error("Prompt cannot be empty")]
    EmptyPrompt,
}

/// A single text-generation request.
///
/// Immutable once built; the prompt is guaranteed non-empty, including for
/// values deserialized from an upstream queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRequestUnit")]
pub struct RequestUnit {
    id: Uuid,
    prompt: String,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawRequestUnit {
    id: Uuid,
    prompt: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<RawRequestUnit> for RequestUnit {
    type Error = ValidationError;

    fn try_from(raw: RawRequestUnit) -> Result<Self, Self::Error> {
        Self::validate_prompt(&raw.prompt)?;
        Ok(Self {
            id: raw.id,
            prompt: raw.prompt,
            created_at: raw.created_at,
        })
    }
}

impl RequestUnit {
    /// Create a request with a fresh id
    pub fn new(prompt: impl Into<String>) -> Result<Self, ValidationError> {
        Self::with_id(Uuid::new_v4(), prompt)
    }

    /// Create a request with a caller-chosen id
    pub fn with_id(id: Uuid, prompt: impl Into<String>) -> Result<Self, ValidationError> {
        let prompt = prompt.into();
        Self::validate_prompt(&prompt)?;
        Ok(Self {
            id,
            prompt,
            created_at: Utc::now(),
        })
    }

    fn validate_prompt(prompt: &str) -> Result<(), ValidationError> {
        if prompt.is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        Ok(())
    }

    /// Unique request id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Prompt text, never empty
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// When the request was built
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// The batch currently accepting requests.
///
/// Its clock starts at the first insertion, so an empty batch never ages.
#[derive(Debug, Default)]
pub struct Batch {
    opened_at: Option<Instant>,
    requests: Vec<RequestUnit>,
}

impl Batch {
    /// An empty batch whose clock has not started
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request, starting the clock on the first one
    pub fn push(&mut self, unit: RequestUnit) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.requests.push(unit);
    }

    /// Number of requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the batch holds no requests
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Time since the first insertion, zero while empty
    pub fn age(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|opened| now.saturating_duration_since(opened))
            .unwrap_or_default()
    }

    /// Which trigger, if any, says this batch should be sealed now
    pub fn readiness(&self, now: Instant, window: Duration, max_requests: usize) -> Option<SealReason> {
        if self.is_empty() {
            return None;
        }
        if self.len() >= max_requests {
            return Some(SealReason::Size);
        }
        if self.age(now) >= window {
            return Some(SealReason::Age);
        }
        None
    }

    pub(crate) fn seal(self, sequence: u64, trigger: SealReason, now: Instant) -> SealedBatch {
        SealedBatch {
            id: Uuid::new_v4(),
            sequence,
            trigger,
            age: self.age(now),
            sealed_at: Utc::now(),
            requests: self.requests,
        }
    }
}

/// Why a batch was sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealReason {
    /// Reached the maximum number of requests
    Size,
    /// Outlived the batch window
    Age,
    /// Flushed unconditionally, e.g. at shutdown
    Flush,
}

impl SealReason {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            SealReason::Size => "size",
            SealReason::Age => "age",
            SealReason::Flush => "flush",
        }
    }
}

/// An immutable batch handed over for execution
#[derive(Debug, Clone)]
pub struct SealedBatch {
    id: Uuid,
    sequence: u64,
    trigger: SealReason,
    age: Duration,
    sealed_at: DateTime<Utc>,
    requests: Vec<RequestUnit>,
}

impl SealedBatch {
    /// Unique batch id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Position in seal order within the batcher that produced it
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Why the batch was sealed
    pub fn trigger(&self) -> SealReason {
        self.trigger
    }

    /// Age of the batch when it was sealed
    pub fn age(&self) -> Duration {
        self.age
    }

    /// Wall-clock seal time
    pub fn sealed_at(&self) -> DateTime<Utc> {
        self.sealed_at
    }

    /// Requests in arrival order
    pub fn requests(&self) -> &[RequestUnit] {
        &self.requests
    }

    /// Request ids in arrival order
    pub fn request_ids(&self) -> Vec<Uuid> {
        self.requests.iter().map(RequestUnit::id).collect()
    }

    /// Number of requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the batch holds no requests
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub(crate) fn into_requests(self) -> Vec<RequestUnit> {
        self.requests
    }
}

/// Lifecycle of a batch executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Built but not started
    Created,
    /// Launching and running requests
    Running,
    /// Every request completed
    Completed,
    /// Cancelled before finishing normally
    Cancelled,
    /// Every request failed, or orchestration failed
    Failed,
    /// Some but not all requests failed
    PartiallyCompleted,
}

impl BatchStatus {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Created | BatchStatus::Running)
    }

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Created => "created",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Failed => "failed",
            BatchStatus::PartiallyCompleted => "partially_completed",
        }
    }
}

/// Counters aggregated over every request of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    /// Requests in the batch
    pub total_requests: usize,
    /// Requests that completed
    pub successful_requests: usize,
    /// Requests that failed, including ones never started
    pub failed_requests: usize,
    /// Sum of the processing time of successful requests
    pub total_processing_time: Duration,
    /// Fragments streamed by successful requests
    pub total_fragments: usize,
}

impl BatchMetrics {
    /// Zeroed counters for a batch of `total_requests`
    pub fn new(total_requests: usize) -> Self {
        Self {
            total_requests,
            ..Self::default()
        }
    }

    /// Fraction of requests that completed, 0 for an empty batch
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    /// Processing time per request, zero for an empty batch
    pub fn avg_processing_time(&self) -> Duration {
        if self.total_requests == 0 {
            return Duration::ZERO;
        }
        self.total_processing_time
            .div_f64(self.total_requests as f64)
    }

    /// Requests that have reached a terminal state
    pub fn finished_requests(&self) -> usize {
        self.successful_requests + self.failed_requests
    }
}

/// Terminal summary of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Id of the batch
    pub batch_id: Uuid,
    /// Terminal status
    pub status: BatchStatus,
    /// Why the batch was sealed
    pub trigger: SealReason,
    /// Requests of the batch in arrival order
    pub request_ids: Vec<Uuid>,
    /// When execution started
    pub start_time: DateTime<Utc>,
    /// When execution finished
    pub end_time: DateTime<Utc>,
    /// Final counters
    pub metrics: BatchMetrics,
    /// Set only for orchestration failures and cancellation
    pub error: Option<String>,
}

impl BatchOutcome {
    /// Wall-clock execution time
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time).to_std().unwrap_or_default()
    }
}
