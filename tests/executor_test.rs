//! Batch executor tests
//!
//! Terminal status rules, request isolation, worker budget, sink retries
//! and cooperative cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use pretty_assertions::assert_eq;
use uuid::Uuid;

use streambatch::batch::{BatchExecutor, BatchStatus, Batcher, RequestUnit, SealedBatch};
use streambatch::config::BatchingConfig;
use streambatch::generator::{EchoGenerator, FragmentStream, Generator};
use streambatch::sink::{MemorySink, RequestStatus, ResultMetadata, ResultSink, SinkError};
use streambatch::StreamBatchError;

fn sealed(prompts: &[&str]) -> SealedBatch {
    let batcher = Batcher::new(Duration::from_secs(60), prompts.len());
    for prompt in prompts {
        batcher
            .accept(RequestUnit::new(*prompt).unwrap())
            .unwrap();
    }
    batcher.flush().expect("batch with requests")
}

fn build(
    prompts: &[&str],
    generator: Arc<dyn Generator>,
    sink: Arc<dyn ResultSink>,
    config: &BatchingConfig,
) -> BatchExecutor {
    BatchExecutor::new(sealed(prompts), generator, sink, config).expect("executor should build")
}

/// Sink whose appends fail a fixed number of times before working again
struct FlakySink {
    inner: MemorySink,
    append_failures: AtomicUsize,
}

impl FlakySink {
    fn new(append_failures: usize) -> Self {
        Self {
            inner: MemorySink::new(),
            append_failures: AtomicUsize::new(append_failures),
        }
    }
}

#[async_trait]
impl ResultSink for FlakySink {
    async fn initialize(&self, id: Uuid) -> Result<(), SinkError> {
        self.inner.initialize(id).await
    }

    async fn append(&self, id: Uuid, fragment: &str) -> Result<(), SinkError> {
        let remaining = self.append_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.append_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError::Backend("connection reset".to_string()));
        }
        self.inner.append(id, fragment).await
    }

    async fn finalize(&self, id: Uuid, metadata: &ResultMetadata) -> Result<(), SinkError> {
        self.inner.finalize(id, metadata).await
    }

    async fn mark_error(&self, id: Uuid, message: &str) -> Result<(), SinkError> {
        self.inner.mark_error(id, message).await
    }

    async fn get_status(&self, id: Uuid) -> Result<RequestStatus, SinkError> {
        self.inner.get_status(id).await
    }

    async fn get_content(&self, id: Uuid) -> Result<Option<String>, SinkError> {
        self.inner.get_content(id).await
    }
}

#[tokio::test]
async fn test_every_request_completes() {
    let sink = Arc::new(MemorySink::new());
    let executor = build(
        &["one", "two", "three"],
        Arc::new(EchoGenerator::new()),
        sink.clone(),
        &BatchingConfig::default(),
    );

    let outcome = executor.run().await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.request_ids, executor.request_ids());
    assert_eq!(outcome.metrics.total_requests, 3);
    assert_eq!(outcome.metrics.successful_requests, 3);
    assert_eq!(outcome.metrics.failed_requests, 0);
    assert_eq!(outcome.metrics.total_fragments, 11);
    assert_eq!(outcome.metrics.success_rate(), 1.0);
    assert!(outcome.error.is_none());

    for (id, prompt) in executor.request_ids().into_iter().zip(["one", "two", "three"]) {
        assert_eq!(sink.get_status(id).await.unwrap(), RequestStatus::Completed);
        assert_eq!(sink.get_content(id).await.unwrap().as_deref(), Some(prompt));
        let meta = sink.metadata(id).expect("completed request has metadata");
        assert_eq!(meta.fragment_count, prompt.len());
    }
}

#[tokio::test]
async fn test_all_failures_mark_batch_failed() {
    let sink = Arc::new(MemorySink::new());
    let executor = build(
        &["bad one", "bad two"],
        Arc::new(EchoGenerator::new().failing_on("bad", 2)),
        sink.clone(),
        &BatchingConfig::default(),
    );

    let outcome = executor.run().await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Failed);
    assert_eq!(outcome.metrics.failed_requests, 2);
    // Request-level failures stay out of the batch error.
    assert!(outcome.error.is_none());
    for id in executor.request_ids() {
        assert_eq!(sink.get_status(id).await.unwrap(), RequestStatus::Failed);
        let content = sink.get_content(id).await.unwrap().unwrap();
        assert!(content.starts_with("Error: "), "unexpected content {content:?}");
    }
}

#[tokio::test]
async fn test_some_failures_mark_batch_partial() {
    let sink = Arc::new(MemorySink::new());
    let executor = build(
        &["fine", "bad", "also fine"],
        Arc::new(EchoGenerator::new().failing_on("bad", 1)),
        sink.clone(),
        &BatchingConfig::default(),
    );
    let ids = executor.request_ids();

    let outcome = executor.run().await.unwrap();

    assert_eq!(outcome.status, BatchStatus::PartiallyCompleted);
    assert_eq!(outcome.metrics.successful_requests, 2);
    assert_eq!(outcome.metrics.failed_requests, 1);
    assert_eq!(sink.get_status(ids[0]).await.unwrap(), RequestStatus::Completed);
    assert_eq!(sink.get_status(ids[1]).await.unwrap(), RequestStatus::Failed);
    assert_eq!(sink.get_content(ids[2]).await.unwrap().as_deref(), Some("also fine"));
}

#[tokio::test]
async fn test_panicking_request_is_isolated() {
    let generator = |prompt: &str| -> FragmentStream {
        if prompt == "explode" {
            panic!("generator exploded");
        }
        stream::iter(vec![Ok(prompt.to_string())]).boxed()
    };
    let sink = Arc::new(MemorySink::new());
    let executor = build(
        &["explode", "calm"],
        Arc::new(generator),
        sink.clone(),
        &BatchingConfig::default(),
    );
    let ids = executor.request_ids();

    let outcome = executor.run().await.unwrap();

    assert_eq!(outcome.status, BatchStatus::PartiallyCompleted);
    let error = sink.error(ids[0]).expect("panic recorded as error");
    assert!(error.contains("generator exploded"), "unexpected error {error:?}");
    assert_eq!(sink.get_status(ids[1]).await.unwrap(), RequestStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_worker_budget_bounds_concurrency() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let generator = {
        let current = current.clone();
        let peak = peak.clone();
        move |prompt: &str| -> FragmentStream {
            let current = current.clone();
            let peak = peak.clone();
            let fragment = prompt.to_string();
            stream::once(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(fragment)
            })
            .boxed()
        }
    };

    let config = BatchingConfig::default().with_max_concurrent_requests_per_batch(2);
    let sink = Arc::new(MemorySink::new());
    let executor = build(
        &["a", "b", "c", "d", "e", "f"],
        Arc::new(generator),
        sink,
        &config,
    );

    let outcome = executor.run().await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 2, "at most two requests at once");
}

#[tokio::test]
async fn test_transient_sink_errors_are_retried() {
    let sink = Arc::new(FlakySink::new(2));
    let config = BatchingConfig::default().with_sink_retry(3, Duration::from_millis(1));
    let executor = build(&["hi"], Arc::new(EchoGenerator::new()), sink.clone(), &config);

    let outcome = executor.run().await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    let id = executor.request_ids()[0];
    assert_eq!(sink.get_content(id).await.unwrap().as_deref(), Some("hi"));
}

#[tokio::test]
async fn test_persistent_sink_errors_degrade_request() {
    let sink = Arc::new(FlakySink::new(usize::MAX));
    let config = BatchingConfig::default().with_sink_retry(2, Duration::from_millis(1));
    let executor = build(&["hi"], Arc::new(EchoGenerator::new()), sink.clone(), &config);

    let outcome = executor.run().await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Failed);
    let id = executor.request_ids()[0];
    assert_eq!(sink.get_status(id).await.unwrap(), RequestStatus::Failed);
    let error = sink.inner.error(id).unwrap();
    assert!(error.contains("connection reset"), "unexpected error {error:?}");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_leaves_every_request_terminal() {
    let sink = Arc::new(MemorySink::new());
    let config = BatchingConfig::default().with_max_concurrent_requests_per_batch(2);
    let executor = Arc::new(build(
        &["first prompt", "second prompt", "third prompt", "fourth prompt"],
        Arc::new(EchoGenerator::new().with_delay(Duration::from_millis(10))),
        sink.clone(),
        &config,
    ));

    let running = tokio::spawn({
        let executor = executor.clone();
        async move { executor.run().await }
    });

    tokio::time::sleep(Duration::from_millis(35)).await;
    assert_eq!(executor.status(), BatchStatus::Running);
    executor.cancel().await;

    // Every request is terminal as soon as cancel returns.
    for id in executor.request_ids() {
        let status = sink.get_status(id).await.unwrap();
        assert!(status.is_terminal(), "request {id} left {status:?}");
    }

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.status, BatchStatus::Cancelled);
    assert!(outcome.error.is_some());
    assert_eq!(outcome.metrics.finished_requests(), 4);

    let never_started = sink
        .ids_with_status(RequestStatus::Failed)
        .into_iter()
        .filter(|id| {
            sink.error(*id).as_deref() == Some("batch cancelled before request started")
        })
        .count();
    assert_eq!(never_started, 2, "requests waiting for a worker never started");

    // Cancelling again is harmless.
    executor.cancel().await;
    assert_eq!(executor.status(), BatchStatus::Cancelled);
}

#[tokio::test]
async fn test_run_is_entered_once() {
    let executor = build(
        &["once"],
        Arc::new(EchoGenerator::new()),
        Arc::new(MemorySink::new()),
        &BatchingConfig::default(),
    );

    executor.run().await.unwrap();
    let err = executor.run().await.unwrap_err();
    assert!(matches!(err, StreamBatchError::AlreadyRunning(id) if id == executor.id()));
}
