//! Accumulates requests into batches bounded by size and age.
//!
//! The batcher owns exactly one current batch. Every mutation of it happens
//! under a single lock, so inserting, checking readiness and sealing can be
//! called from any number of tasks without losing or duplicating a request.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::batch::types::{Batch, RequestUnit, SealReason, SealedBatch};
use crate::config::BatchingConfig;
use crate::metrics;
use crate::{Result, StreamBatchError};

#[derive(Debug, Default)]
struct BatcherState {
    current: Option<Batch>,
    sealed: u64,
    closed: bool,
}

impl BatcherState {
    fn take_sealed(&mut self, trigger: SealReason, now: Instant) -> Option<SealedBatch> {
        let batch = self.current.take().filter(|batch| !batch.is_empty())?;
        let sealed = batch.seal(self.sealed, trigger, now);
        self.sealed += 1;

        info!(
            batch_id = %sealed.id(),
            batch_size = sealed.len(),
            batch_age_ms = sealed.age().as_millis() as u64,
            reason = sealed.trigger().as_str(),
            "Sealed batch"
        );
        metrics::record_batch_sealed(trigger);

        Some(sealed)
    }
}

/// Groups arriving requests into time/size-bounded batches
#[derive(Debug)]
pub struct Batcher {
    batch_window: Duration,
    max_requests_per_batch: usize,
    state: Mutex<BatcherState>,
}

impl Batcher {
    /// Create a batcher with explicit triggers; `max_requests_per_batch` is clamped to 1
    pub fn new(batch_window: Duration, max_requests_per_batch: usize) -> Self {
        Self {
            batch_window,
            max_requests_per_batch: max_requests_per_batch.max(1),
            state: Mutex::new(BatcherState::default()),
        }
    }

    /// Create a batcher from the triggers of a configuration
    pub fn from_config(config: &BatchingConfig) -> Self {
        Self::new(config.batch_window, config.max_requests_per_batch)
    }

    /// Maximum age of a batch before the age trigger fires
    pub fn batch_window(&self) -> Duration {
        self.batch_window
    }

    /// Size at which the size trigger fires
    pub fn max_requests_per_batch(&self) -> usize {
        self.max_requests_per_batch
    }

    /// Append a request to the current batch, opening one if needed.
    ///
    /// If the current batch was already ready before this insertion it is
    /// sealed first and returned, and the request opens a fresh batch. Fails
    /// with [`StreamBatchError::ShuttingDown`] once the batcher is closed.
    pub fn accept(&self, unit: RequestUnit) -> Result<Option<SealedBatch>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.closed {
            return Err(StreamBatchError::ShuttingDown);
        }

        let ready = state.current.as_ref().and_then(|batch| {
            batch.readiness(now, self.batch_window, self.max_requests_per_batch)
        });
        let displaced = match ready {
            Some(trigger) => state.take_sealed(trigger, now),
            None => None,
        };

        let batch = state.current.get_or_insert_with(Batch::new);
        debug!(
            request_id = %unit.id(),
            current_batch_size = batch.len(),
            batch_age_ms = batch.age(now).as_millis() as u64,
            "Adding request to batch"
        );
        batch.push(unit);
        metrics::record_request_accepted();

        Ok(displaced)
    }

    /// Seal and return the current batch if its size or age trigger holds
    pub fn check_readiness(&self) -> Option<SealedBatch> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let trigger = state
            .current
            .as_ref()?
            .readiness(now, self.batch_window, self.max_requests_per_batch)?;
        state.take_sealed(trigger, now)
    }

    /// Seal and return the current batch regardless of triggers
    pub fn flush(&self) -> Option<SealedBatch> {
        self.state.lock().take_sealed(SealReason::Flush, Instant::now())
    }

    /// Flush and refuse every later insertion
    pub fn close(&self) -> Option<SealedBatch> {
        let mut state = self.state.lock();
        state.closed = true;
        state.take_sealed(SealReason::Flush, Instant::now())
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Time left before the age trigger fires; `None` without a current batch
    pub fn time_until_ready(&self) -> Option<Duration> {
        let now = Instant::now();
        let state = self.state.lock();
        let batch = state.current.as_ref().filter(|batch| !batch.is_empty())?;
        if batch.len() >= self.max_requests_per_batch {
            return Some(Duration::ZERO);
        }
        Some(self.batch_window.saturating_sub(batch.age(now)))
    }

    /// Requests waiting in the current batch
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .current
            .as_ref()
            .map_or(0, Batch::len)
    }

    /// Number of batches sealed so far
    pub fn sealed_count(&self) -> u64 {
        self.state.lock().sealed
    }
}
