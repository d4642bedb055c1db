//! Metrics collection for batching and batch execution
//!
//! Provides Prometheus-compatible metrics for monitoring admission, batch
//! sealing, executor concurrency and request outcomes.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

use crate::batch::{BatchStatus, SealReason};
use crate::sink::RequestStatus;

lazy_static! {
    /// Counter for requests accepted into a batch
    static ref REQUESTS_ACCEPTED: IntCounter = register_int_counter!(
        "streambatch_requests_accepted_total",
        "Total number of requests accepted by the batcher"
    ).unwrap();

    /// Counter for sealed batches by trigger
    static ref BATCHES_SEALED: IntCounterVec = register_int_counter_vec!(
        "streambatch_batches_sealed_total",
        "Total number of sealed batches",
        &["trigger"]
    ).unwrap();

    /// Counter for batch outcomes by terminal status
    static ref BATCH_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "streambatch_batch_outcomes_total",
        "Total number of finished batches",
        &["status"]
    ).unwrap();

    /// Counter for request outcomes by terminal status
    static ref REQUEST_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "streambatch_request_outcomes_total",
        "Total number of finished requests",
        &["status"]
    ).unwrap();

    /// Counter for streamed fragments
    static ref FRAGMENTS_STREAMED: IntCounter = register_int_counter!(
        "streambatch_fragments_streamed_total",
        "Total number of fragments written to the result sink"
    ).unwrap();

    /// Gauge for running batch executors
    static ref ACTIVE_BATCHES: IntGauge = register_int_gauge!(
        "streambatch_active_batches",
        "Number of currently running batch executors"
    ).unwrap();

    /// Gauge for in-flight requests
    static ref ACTIVE_REQUESTS: IntGauge = register_int_gauge!(
        "streambatch_active_requests",
        "Number of requests currently generating"
    ).unwrap();

    /// Histogram for batch duration
    static ref BATCH_DURATION: Histogram = register_histogram!(
        "streambatch_batch_duration_seconds",
        "Batch execution duration in seconds",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).unwrap();
}

pub(crate) fn record_request_accepted() {
    REQUESTS_ACCEPTED.inc();
}

pub(crate) fn record_batch_sealed(trigger: SealReason) {
    BATCHES_SEALED.with_label_values(&[trigger.as_str()]).inc();
}

pub(crate) fn record_batch_started() {
    ACTIVE_BATCHES.inc();
}

pub(crate) fn record_batch_finished(status: BatchStatus, duration_secs: f64) {
    ACTIVE_BATCHES.dec();
    BATCH_OUTCOMES.with_label_values(&[status.as_str()]).inc();
    BATCH_DURATION.observe(duration_secs);
}

pub(crate) fn record_request_started() {
    ACTIVE_REQUESTS.inc();
}

pub(crate) fn record_request_finished(status: RequestStatus) {
    ACTIVE_REQUESTS.dec();
    record_request_outcome(status);
}

/// Count an outcome for a request that never started running
pub(crate) fn record_request_outcome(status: RequestStatus) {
    REQUEST_OUTCOMES.with_label_values(&[status.as_str()]).inc();
}

pub(crate) fn record_fragment() {
    FRAGMENTS_STREAMED.inc();
}

/// Render every registered collector in the Prometheus text format
pub fn export() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
