//! Batch executor.
//!
//! Runs every request of one sealed batch concurrently, with:
//! - a per-batch worker budget acquired in arrival order by the dispatch loop
//! - request-level failure isolation (a failed request never aborts its siblings)
//! - sink writes retried with exponential backoff
//! - cooperative cancellation between fragments
//! - a single [`BatchOutcome`] summarising the batch

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::batch::types::{BatchMetrics, BatchOutcome, BatchStatus, RequestUnit, SealReason, SealedBatch};
use crate::config::BatchingConfig;
use crate::generator::{GenerationError, Generator};
use crate::metrics;
use crate::sink::{RequestStatus, ResultMetadata, ResultSink, SinkError};
use crate::{Result, StreamBatchError};

const CANCELLED_MESSAGE: &str = "request cancelled";
const NOT_STARTED_MESSAGE: &str = "batch cancelled before request started";

/// Everything a per-request task needs, cloned into each task
#[derive(Clone)]
struct RequestWorker {
    batch_id: Uuid,
    generator: Arc<dyn Generator>,
    sink: Arc<dyn ResultSink>,
    metrics: Arc<Mutex<BatchMetrics>>,
    cancel_token: CancellationToken,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl RequestWorker {
    /// Run one request to a terminal sink status
    async fn process(self, unit: RequestUnit) {
        let request_id = unit.id();
        metrics::record_request_started();
        debug!(batch_id = %self.batch_id, request_id = %request_id, "Request starting");

        let result = match AssertUnwindSafe(self.stream_request(&unit)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(GenerationError::Failed(panic_message(panic)).into()),
        };

        match result {
            Ok(metadata) => {
                {
                    let mut batch_metrics = self.metrics.lock();
                    batch_metrics.successful_requests += 1;
                    batch_metrics.total_processing_time += metadata.processing_time;
                    batch_metrics.total_fragments += metadata.fragment_count;
                }
                info!(
                    batch_id = %self.batch_id,
                    request_id = %request_id,
                    fragments = metadata.fragment_count,
                    processing_time_ms = metadata.processing_time.as_millis() as u64,
                    fragments_per_second = format!("{:.2}", metadata.fragments_per_second),
                    "Request completed"
                );
                metrics::record_request_finished(RequestStatus::Completed);
            }
            Err(e) => {
                let message = match &e {
                    StreamBatchError::Generation(GenerationError::Interrupted) => {
                        CANCELLED_MESSAGE.to_string()
                    }
                    other => other.to_string(),
                };
                error!(
                    batch_id = %self.batch_id,
                    request_id = %request_id,
                    error = %message,
                    "Request failed"
                );
                self.fail(request_id, &message).await;
                metrics::record_request_finished(RequestStatus::Failed);
            }
        }
    }

    /// Initialize, stream every fragment, then finalize
    async fn stream_request(&self, unit: &RequestUnit) -> Result<ResultMetadata> {
        let request_id = unit.id();
        let started = Instant::now();
        let sink = self.sink.as_ref();

        self.with_retry(request_id, "initialize", || sink.initialize(request_id))
            .await?;

        let mut fragments = self.generator.generate(unit.prompt());
        let mut fragment_count = 0usize;
        loop {
            // Checked between fragments only; the in-flight one always lands.
            if self.cancel_token.is_cancelled() {
                return Err(GenerationError::Interrupted.into());
            }
            let Some(fragment) = fragments.next().await else {
                break;
            };
            let fragment = fragment?;
            let text = fragment.as_str();
            self.with_retry(request_id, "append", || sink.append(request_id, text))
                .await?;
            fragment_count += 1;
            metrics::record_fragment();
        }

        let metadata = ResultMetadata::new(started.elapsed(), fragment_count);
        self.with_retry(request_id, "finalize", || sink.finalize(request_id, &metadata))
            .await?;
        Ok(metadata)
    }

    /// Record a failed request in the sink and the batch metrics
    async fn fail(&self, request_id: Uuid, message: &str) {
        let sink = self.sink.as_ref();
        if let Err(e) = self
            .with_retry(request_id, "mark_error", || sink.mark_error(request_id, message))
            .await
        {
            error!(
                batch_id = %self.batch_id,
                request_id = %request_id,
                error = %e,
                "Could not record request failure"
            );
        }
        self.metrics.lock().failed_requests += 1;
    }

    /// Retry a sink write with exponential backoff
    async fn with_retry<F, Fut>(
        &self,
        request_id: Uuid,
        operation: &'static str,
        mut write: F,
    ) -> std::result::Result<(), SinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), SinkError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match write().await {
                Ok(()) => return Ok(()),
                Err(e @ SinkError::AlreadyTerminal(_)) => return Err(e),
                Err(e) if attempts >= self.retry_attempts => {
                    warn!(
                        request_id = %request_id,
                        operation,
                        attempts,
                        error = %e,
                        "Sink write failed after all retries"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        request_id = %request_id,
                        operation,
                        attempt = attempts,
                        error = %e,
                        "Sink write failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay * 2u32.saturating_pow(attempts - 1)).await;
                }
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("request task panicked: {detail}")
}

/// Executes every request of one sealed batch
pub struct BatchExecutor {
    id: Uuid,
    sequence: u64,
    trigger: SealReason,
    requests: Vec<RequestUnit>,
    worker: RequestWorker,
    /// Per-batch worker budget
    worker_budget: Arc<Semaphore>,
    max_concurrent_requests: usize,
    status: Mutex<BatchStatus>,
    start_time: Mutex<Option<DateTime<Utc>>>,
    tracker: TaskTracker,
}

impl BatchExecutor {
    /// Build an executor for a sealed batch; empty batches are rejected
    pub fn new(
        batch: SealedBatch,
        generator: Arc<dyn Generator>,
        sink: Arc<dyn ResultSink>,
        config: &BatchingConfig,
    ) -> Result<Self> {
        if batch.is_empty() {
            return Err(StreamBatchError::Orchestration(format!(
                "batch {} has no requests",
                batch.id()
            )));
        }

        let id = batch.id();
        let sequence = batch.sequence();
        let trigger = batch.trigger();
        let requests = batch.into_requests();
        let max_concurrent_requests = config.max_concurrent_requests_per_batch.max(1);

        Ok(Self {
            id,
            sequence,
            trigger,
            worker: RequestWorker {
                batch_id: id,
                generator,
                sink,
                metrics: Arc::new(Mutex::new(BatchMetrics::new(requests.len()))),
                cancel_token: CancellationToken::new(),
                retry_attempts: config.sink_retry_attempts.max(1),
                retry_delay: config.sink_retry_delay,
            },
            requests,
            worker_budget: Arc::new(Semaphore::new(max_concurrent_requests)),
            max_concurrent_requests,
            status: Mutex::new(BatchStatus::Created),
            start_time: Mutex::new(None),
            tracker: TaskTracker::new(),
        })
    }

    /// Id of the batch being executed
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Seal order of the batch
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Why the batch was sealed
    pub fn trigger(&self) -> SealReason {
        self.trigger
    }

    /// Current lifecycle status
    pub fn status(&self) -> BatchStatus {
        *self.status.lock()
    }

    /// Snapshot of the counters so far
    pub fn metrics(&self) -> BatchMetrics {
        self.worker.metrics.lock().clone()
    }

    /// Request ids in arrival order
    pub fn request_ids(&self) -> Vec<Uuid> {
        self.requests.iter().map(RequestUnit::id).collect()
    }

    /// Number of requests in the batch
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Always false; empty batches are rejected by `new`
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Run the batch to a terminal status.
    ///
    /// Fails with [`StreamBatchError::AlreadyRunning`] unless the executor is
    /// still `Created`. Request-level failures never surface here; they are
    /// counted in the outcome's metrics.
    #[instrument(skip(self), fields(batch_id = %self.id, batch_size = self.requests.len()))]
    pub async fn run(&self) -> Result<BatchOutcome> {
        {
            let mut status = self.status.lock();
            if *status != BatchStatus::Created {
                return Err(StreamBatchError::AlreadyRunning(self.id));
            }
            *status = BatchStatus::Running;
        }

        let start_time = Utc::now();
        *self.start_time.lock() = Some(start_time);
        let started = Instant::now();
        metrics::record_batch_started();

        info!(
            batch_id = %self.id,
            sequence = self.sequence,
            trigger = self.trigger.as_str(),
            total_requests = self.requests.len(),
            max_concurrent_requests = self.max_concurrent_requests,
            "Starting batch execution"
        );

        let mut launched = 0usize;
        let orchestration_error = self.dispatch(&mut launched).await.err();
        if let Some(e) = &orchestration_error {
            error!(batch_id = %self.id, error = %e, "Batch orchestration failed");
            self.worker.cancel_token.cancel();
        }

        self.abandon_unlaunched(launched).await;
        self.tracker.close();
        self.tracker.wait().await;

        let batch_metrics = self.metrics();
        let (status, error) = if let Some(e) = orchestration_error {
            (BatchStatus::Failed, Some(e.to_string()))
        } else if self.worker.cancel_token.is_cancelled() {
            (BatchStatus::Cancelled, Some("batch cancelled".to_string()))
        } else if batch_metrics.failed_requests == batch_metrics.total_requests {
            (BatchStatus::Failed, None)
        } else if batch_metrics.failed_requests > 0 {
            (BatchStatus::PartiallyCompleted, None)
        } else {
            (BatchStatus::Completed, None)
        };
        *self.status.lock() = status;

        let duration = started.elapsed();
        metrics::record_batch_finished(status, duration.as_secs_f64());

        info!(
            batch_id = %self.id,
            status = status.as_str(),
            total_requests = batch_metrics.total_requests,
            successful = batch_metrics.successful_requests,
            failed = batch_metrics.failed_requests,
            fragments = batch_metrics.total_fragments,
            success_rate = format!("{:.2}%", batch_metrics.success_rate() * 100.0),
            avg_processing_time_ms = batch_metrics.avg_processing_time().as_millis() as u64,
            batch_duration_ms = duration.as_millis() as u64,
            "Batch execution completed"
        );

        Ok(BatchOutcome {
            batch_id: self.id,
            status,
            trigger: self.trigger,
            request_ids: self.request_ids(),
            start_time,
            end_time: Utc::now(),
            metrics: batch_metrics,
            error,
        })
    }

    /// Launch requests in arrival order, one worker-budget slot each
    async fn dispatch(&self, launched: &mut usize) -> Result<()> {
        for unit in &self.requests {
            let permit = tokio::select! {
                biased;
                _ = self.worker.cancel_token.cancelled() => {
                    debug!(batch_id = %self.id, launched = *launched, "Dispatch stopped by cancellation");
                    return Ok(());
                }
                permit = self.worker_budget.clone().acquire_owned() => permit.map_err(|e| {
                    StreamBatchError::Orchestration(format!("worker budget unavailable: {e}"))
                })?,
            };

            if self.worker.cancel_token.is_cancelled() {
                // Slot acquired but never used.
                drop(permit);
                return Ok(());
            }

            let worker = self.worker.clone();
            let unit = unit.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                worker.process(unit).await;
            });
            *launched += 1;
        }
        Ok(())
    }

    /// Resolve requests that never got a worker slot as failed
    async fn abandon_unlaunched(&self, launched: usize) {
        let remaining = &self.requests[launched.min(self.requests.len())..];
        if remaining.is_empty() {
            return;
        }

        warn!(
            batch_id = %self.id,
            not_started = remaining.len(),
            "Marking requests that never started as failed"
        );
        for unit in remaining {
            self.worker.fail(unit.id(), NOT_STARTED_MESSAGE).await;
            metrics::record_request_outcome(RequestStatus::Failed);
        }
    }

    /// Request cancellation and wait until every request is terminal.
    ///
    /// Idempotent. On an executor that has not started yet this returns
    /// immediately; a later `run` launches nothing, fails every request and
    /// reports `Cancelled`.
    pub async fn cancel(&self) {
        if !self.worker.cancel_token.is_cancelled() {
            info!(batch_id = %self.id, status = self.status().as_str(), "Cancelling batch");
            self.worker.cancel_token.cancel();
        }
        if self.status() == BatchStatus::Created {
            return;
        }
        self.tracker.wait().await;
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.worker.cancel_token.is_cancelled()
    }

    /// When `run` started, if it has
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start_time.lock()
    }

    #[cfg(test)]
    pub(crate) fn close_worker_budget(&self) {
        self.worker_budget.close();
    }
}
