//! # streambatch
//!
//! Groups a stream of independent text-generation requests into bounded
//! batches and executes each batch concurrently under a two-tier admission
//! control, streaming every request's output fragment by fragment into a
//! result store that consumers poll.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use streambatch::batch::JobManager;
//! use streambatch::config::BatchingConfig;
//! use streambatch::generator::TextGenerator;
//! use streambatch::sink::{MemorySink, ResultSink};
//!
//! # async fn example() -> streambatch::Result<()> {
//! let sink = Arc::new(MemorySink::new());
//! let manager = JobManager::new(
//!     BatchingConfig::default(),
//!     Arc::new(TextGenerator::new()),
//!     sink.clone(),
//! )?;
//! let run_loop = manager.spawn_run_loop();
//!
//! let id = manager.submit_prompt("tell me about batching").await?;
//! let status = sink.get_status(id).await?;
//! println!("{id}: {status:?}");
//!
//! manager.shutdown().await?;
//! run_loop.await??;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`batch`]: request/batch model, the batcher, the batch executor and the job manager
//! - [`sink`]: where streamed output and per-request status are written
//! - [`generator`]: producers of text fragments
//! - [`queue`]: optional upstream request source
//! - [`config`]: batching and backend configuration
//! - [`metrics`]: Prometheus collectors
//! - [`telemetry`]: tracing subscriber setup

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;
use uuid::Uuid;

/// Result type for streambatch operations
pub type Result<T> = std::result::Result<T, StreamBatchError>;

/// Main error type for streambatch operations
#[derive(Error, Debug)]
pub enum StreamBatchError {
    /// Malformed request rejected at admission
    #[error("Validation error: {0}")]
    Validation(#[from] batch::ValidationError),

    /// Failure while producing fragments for one request
    #[error("Generation error: {0}")]
    Generation(#[from] generator::GenerationError),

    /// Failure writing to the result sink
    #[error("Sink error: {0}")]
    Sink(#[from] sink::SinkError),

    /// Failure talking to the upstream queue
    #[error("Queue error: {0}")]
    Queue(#[from] queue::QueueError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Failure in an executor's own control flow
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    /// `run` called on an executor that already left the `Created` state
    #[error("Batch {0} is already running")]
    AlreadyRunning(Uuid),

    /// A second manager loop was started
    #[error("Job manager loop is already running")]
    ManagerAlreadyRunning,

    /// The manager no longer accepts requests
    #[error("Job manager is shutting down")]
    ShuttingDown,

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Request batching and batch execution
pub mod batch;

/// Batching and backend configuration
pub mod config;

/// Text fragment producers
pub mod generator;

/// Prometheus metrics
pub mod metrics;

/// Upstream request sources
pub mod queue;

/// Result storage for streamed output
pub mod sink;

/// Logging setup
pub mod telemetry;
