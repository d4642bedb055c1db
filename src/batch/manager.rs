//! Job manager: turns ready batches into running executors.
//!
//! Two admission tiers apply. Each executor bounds the requests it runs at
//! once, and the manager bounds how many executors run at once across the
//! whole process. Batches waiting for a global slot queue up; they are never
//! dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::batch::batcher::Batcher;
use crate::batch::executor::BatchExecutor;
use crate::batch::types::{BatchOutcome, RequestUnit, SealedBatch};
use crate::config::BatchingConfig;
use crate::generator::Generator;
use crate::queue::UpstreamQueue;
use crate::sink::ResultSink;
use crate::{Result, StreamBatchError};

/// Counters describing the manager's activity so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Requests accepted by the batcher
    pub requests_accepted: u64,
    /// Sealed batches handed to `dispatch`
    pub batches_dispatched: u64,
    /// Dispatched batches whose task has finished
    pub batches_finished: u64,
    /// Executors that could not be built or started
    pub launch_failures: u64,
    /// Executors holding a global slot right now
    pub active_batches: usize,
    /// Highest number of executors ever running at once
    pub peak_active_batches: usize,
}

#[derive(Debug, Default)]
struct StatsCounters {
    requests_accepted: AtomicU64,
    batches_dispatched: AtomicU64,
    batches_finished: AtomicU64,
    launch_failures: AtomicU64,
    peak_active_batches: AtomicUsize,
}

struct ManagerInner {
    config: BatchingConfig,
    batcher: Batcher,
    generator: Arc<dyn Generator>,
    sink: Arc<dyn ResultSink>,
    upstream: Option<Arc<dyn UpstreamQueue>>,
    /// Global job slots, one per running executor
    job_slots: Arc<Semaphore>,
    active: DashMap<Uuid, Arc<BatchExecutor>>,
    outcomes: broadcast::Sender<BatchOutcome>,
    shutdown_token: CancellationToken,
    shutting_down: AtomicBool,
    loop_running: AtomicBool,
    tracker: TaskTracker,
    stats: StatsCounters,
}

/// Holds a global slot and the executor's place in the active set.
///
/// Dropping it removes the executor first, then releases the slot, so the
/// active count never exceeds the slot count.
struct ActiveSlot<'a> {
    active: &'a DashMap<Uuid, Arc<BatchExecutor>>,
    batch_id: Uuid,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.batch_id);
    }
}

struct LoopGuard<'a>(&'a AtomicBool);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ManagerInner {
    /// Wait for a global slot, run the batch, then report and release
    async fn execute(&self, batch: SealedBatch) {
        let batch_id = batch.id();
        let permit = match self.job_slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "No job slot available, batch not launched");
                self.stats.launch_failures.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        let executor = match BatchExecutor::new(
            batch,
            self.generator.clone(),
            self.sink.clone(),
            &self.config,
        ) {
            Ok(executor) => Arc::new(executor),
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "Failed to launch batch executor");
                self.stats.launch_failures.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        self.active.insert(batch_id, executor.clone());
        let _slot = ActiveSlot {
            active: &self.active,
            batch_id,
            _permit: permit,
        };
        let active_now = self.active.len();
        self.stats
            .peak_active_batches
            .fetch_max(active_now, Ordering::SeqCst);
        debug!(batch_id = %batch_id, active_batches = active_now, "Batch executor launched");

        let outcome = executor.run().await;

        if let Some(queue) = &self.upstream {
            if let Err(e) = queue.acknowledge(&executor.request_ids()).await {
                warn!(batch_id = %batch_id, error = %e, "Failed to acknowledge upstream requests");
            }
        }

        match outcome {
            Ok(outcome) => {
                // No subscribers is fine.
                let _ = self.outcomes.send(outcome);
            }
            Err(e) => error!(batch_id = %batch_id, error = %e, "Batch executor did not run"),
        }
        self.stats.batches_finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// Owns the batcher and runs sealed batches under a global concurrency cap.
///
/// Cheap to clone; every clone drives the same manager.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    /// Create a manager fed only by [`submit`](Self::submit)
    pub fn new(
        config: BatchingConfig,
        generator: Arc<dyn Generator>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        Self::build(config, generator, sink, None)
    }

    /// Create a manager that also pulls requests from an upstream queue
    pub fn with_upstream(
        config: BatchingConfig,
        generator: Arc<dyn Generator>,
        sink: Arc<dyn ResultSink>,
        upstream: Arc<dyn UpstreamQueue>,
    ) -> Result<Self> {
        Self::build(config, generator, sink, Some(upstream))
    }

    fn build(
        config: BatchingConfig,
        generator: Arc<dyn Generator>,
        sink: Arc<dyn ResultSink>,
        upstream: Option<Arc<dyn UpstreamQueue>>,
    ) -> Result<Self> {
        config.validate()?;
        let (outcomes, _) = broadcast::channel(config.outcome_buffer);

        info!(
            batch_window_ms = config.batch_window.as_millis() as u64,
            max_requests_per_batch = config.max_requests_per_batch,
            max_concurrent_requests_per_batch = config.max_concurrent_requests_per_batch,
            max_concurrent_batches = config.max_concurrent_batches,
            upstream = upstream.is_some(),
            "Creating job manager"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                batcher: Batcher::from_config(&config),
                job_slots: Arc::new(Semaphore::new(config.max_concurrent_batches)),
                config,
                generator,
                sink,
                upstream,
                active: DashMap::new(),
                outcomes,
                shutdown_token: CancellationToken::new(),
                shutting_down: AtomicBool::new(false),
                loop_running: AtomicBool::new(false),
                tracker: TaskTracker::new(),
                stats: StatsCounters::default(),
            }),
        })
    }

    /// Configuration the manager was built with
    pub fn config(&self) -> &BatchingConfig {
        &self.inner.config
    }

    /// Accept a request, dispatching whatever batch becomes ready
    pub async fn submit(&self, unit: RequestUnit) -> Result<()> {
        if self.is_shutting_down() {
            return Err(StreamBatchError::ShuttingDown);
        }

        if let Some(displaced) = self.inner.batcher.accept(unit)? {
            self.dispatch(displaced);
        }
        self.inner
            .stats
            .requests_accepted
            .fetch_add(1, Ordering::SeqCst);

        if let Some(batch) = self.inner.batcher.check_readiness() {
            self.dispatch(batch);
        }
        Ok(())
    }

    /// Validate a prompt, submit it and return the new request's id
    pub async fn submit_prompt(&self, prompt: impl Into<String>) -> Result<Uuid> {
        let unit = RequestUnit::new(prompt)?;
        let id = unit.id();
        self.submit(unit).await?;
        Ok(id)
    }

    /// Hand a sealed batch to a background task.
    ///
    /// The task waits for a global slot, runs the batch, acknowledges its
    /// requests upstream and publishes the outcome. Launch failures are
    /// logged and counted, never returned.
    pub fn dispatch(&self, batch: SealedBatch) {
        self.inner
            .stats
            .batches_dispatched
            .fetch_add(1, Ordering::SeqCst);
        info!(
            batch_id = %batch.id(),
            sequence = batch.sequence(),
            batch_size = batch.len(),
            trigger = batch.trigger().as_str(),
            "Dispatching batch"
        );

        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            inner.execute(batch).await;
        });
    }

    /// Periodically seal aged batches and pull from the upstream queue.
    ///
    /// Sleeps until the current batch's window closes or the tick elapses,
    /// whichever is sooner. Returns once shutdown is signalled.
    pub async fn run_loop(&self) -> Result<()> {
        if self.inner.loop_running.swap(true, Ordering::SeqCst) {
            return Err(StreamBatchError::ManagerAlreadyRunning);
        }
        let _running = LoopGuard(&self.inner.loop_running);
        let tick = self.inner.config.tick_interval;
        info!(tick_ms = tick.as_millis() as u64, "Job manager loop started");

        loop {
            let wait = self
                .inner
                .batcher
                .time_until_ready()
                .map_or(tick, |remaining| remaining.min(tick));

            tokio::select! {
                _ = self.inner.shutdown_token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            if self.is_shutting_down() {
                break;
            }
            if let Some(queue) = &self.inner.upstream {
                self.pull_upstream(queue.as_ref()).await;
            }
            if let Some(batch) = self.inner.batcher.check_readiness() {
                self.dispatch(batch);
            }
        }

        info!("Job manager loop stopped");
        Ok(())
    }

    /// Start [`run_loop`](Self::run_loop) on the current runtime
    pub fn spawn_run_loop(&self) -> JoinHandle<Result<()>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run_loop().await })
    }

    async fn pull_upstream(&self, queue: &dyn UpstreamQueue) {
        // Fetched requests could no longer be accepted.
        if self.is_shutting_down() {
            return;
        }
        let fetched = match queue.fetch(self.inner.config.max_requests_per_batch).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(error = %e, "Failed to fetch from upstream queue");
                return;
            }
        };

        for unit in fetched {
            let request_id = unit.id();
            if let Err(e) = self.submit(unit).await {
                warn!(request_id = %request_id, error = %e, "Upstream request rejected, left unacknowledged");
            }
        }
    }

    /// Stop the manager.
    ///
    /// Stops the loop, cancels every running executor and waits for it,
    /// flushes the current batch and runs it to completion, then closes the
    /// upstream queue. Later calls only wait for the first one to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            self.inner.tracker.wait().await;
            return Ok(());
        }

        info!("Shutting down job manager");
        self.inner.shutdown_token.cancel();

        let active: Vec<Arc<BatchExecutor>> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(active_batches = active.len(), "Cancelling active batches");
        join_all(active.iter().map(|executor| executor.cancel())).await;

        if let Some(batch) = self.inner.batcher.close() {
            info!(batch_id = %batch.id(), batch_size = batch.len(), "Dispatching final batch");
            self.dispatch(batch);
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        if let Some(queue) = &self.inner.upstream {
            if let Err(e) = queue.close().await {
                warn!(error = %e, "Failed to close upstream queue");
            }
        }

        let stats = self.stats();
        info!(
            requests_accepted = stats.requests_accepted,
            batches_dispatched = stats.batches_dispatched,
            batches_finished = stats.batches_finished,
            launch_failures = stats.launch_failures,
            "Job manager shut down"
        );
        Ok(())
    }

    /// Whether `shutdown` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Receive every batch outcome published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BatchOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Number of executors currently holding a global slot
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Requests waiting in the current, unsealed batch
    pub fn pending_requests(&self) -> usize {
        self.inner.batcher.pending()
    }

    /// Snapshot of the manager counters
    pub fn stats(&self) -> ManagerStats {
        let stats = &self.inner.stats;
        ManagerStats {
            requests_accepted: stats.requests_accepted.load(Ordering::SeqCst),
            batches_dispatched: stats.batches_dispatched.load(Ordering::SeqCst),
            batches_finished: stats.batches_finished.load(Ordering::SeqCst),
            launch_failures: stats.launch_failures.load(Ordering::SeqCst),
            active_batches: self.inner.active.len(),
            peak_active_batches: stats.peak_active_batches.load(Ordering::SeqCst),
        }
    }
}
