//! Batcher tests
//!
//! Property tests over arbitrary accept/check/flush interleavings plus the
//! timing scenarios on a paused clock.

use std::collections::HashSet;
use std::time::Duration;

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use streambatch::batch::{Batcher, RequestUnit, SealReason, SealedBatch};
use streambatch::StreamBatchError;

#[derive(Debug, Clone)]
enum Op {
    Accept,
    Check,
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => Just(Op::Accept),
        3 => Just(Op::Check),
        1 => Just(Op::Flush),
    ]
}

proptest! {
    #[test]
    fn prop_every_request_sealed_exactly_once(
        max in 1usize..8,
        ops in prop::collection::vec(op(), 0..200),
    ) {
        // A long window keeps this about the size trigger and flushes.
        let batcher = Batcher::new(Duration::from_secs(3600), max);
        let mut accepted = Vec::new();
        let mut sealed: Vec<SealedBatch> = Vec::new();

        for op in ops {
            match op {
                Op::Accept => {
                    let unit = RequestUnit::new(format!("request {}", accepted.len())).unwrap();
                    accepted.push(unit.id());
                    sealed.extend(batcher.accept(unit).unwrap());
                }
                Op::Check => sealed.extend(batcher.check_readiness()),
                Op::Flush => sealed.extend(batcher.flush()),
            }
        }
        sealed.extend(batcher.close());

        let mut seen = Vec::new();
        for (index, batch) in sealed.iter().enumerate() {
            prop_assert!(!batch.is_empty());
            prop_assert!(batch.len() <= max);
            prop_assert_eq!(batch.sequence(), index as u64);
            seen.extend(batch.request_ids());
        }

        // Arrival order survives batching.
        prop_assert_eq!(seen, accepted);
    }

    #[test]
    fn prop_size_trigger_never_waits(max in 1usize..10) {
        let batcher = Batcher::new(Duration::from_secs(3600), max);
        for i in 0..max {
            let accepted = batcher.accept(RequestUnit::new(format!("p{i}")).unwrap()).unwrap();
            prop_assert!(accepted.is_none());
        }
        let batch = batcher.check_readiness();
        prop_assert!(batch.is_some());
        let batch = batch.unwrap();
        prop_assert_eq!(batch.len(), max);
        prop_assert_eq!(batch.trigger(), SealReason::Size);
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_requests_then_window_elapses() {
    let batcher = Batcher::new(Duration::from_millis(250), 4);
    let a = RequestUnit::new("a").unwrap();
    let b = RequestUnit::new("b").unwrap();
    batcher.accept(a.clone()).unwrap();
    batcher.accept(b.clone()).unwrap();
    assert!(batcher.check_readiness().is_none());

    tokio::time::advance(Duration::from_millis(260)).await;

    let batch = batcher.check_readiness().expect("age trigger");
    assert_eq!(batch.trigger(), SealReason::Age);
    assert_eq!(batch.request_ids(), vec![a.id(), b.id()]);
    assert!(batch.age() >= Duration::from_millis(250));
    assert!(batcher.check_readiness().is_none(), "sealed exactly once");
}

#[tokio::test(start_paused = true)]
async fn test_four_requests_within_ten_millis() {
    let batcher = Batcher::new(Duration::from_millis(250), 4);
    let mut sealed = Vec::new();
    for i in 0..4 {
        sealed.extend(batcher.accept(RequestUnit::new(format!("p{i}")).unwrap()).unwrap());
        sealed.extend(batcher.check_readiness());
        tokio::time::advance(Duration::from_millis(2)).await;
    }

    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].len(), 4);
    assert_eq!(sealed[0].trigger(), SealReason::Size);
}

#[tokio::test(start_paused = true)]
async fn test_time_until_ready_tracks_window() {
    let batcher = Batcher::new(Duration::from_millis(100), 3);
    assert_eq!(batcher.time_until_ready(), None);

    batcher.accept(RequestUnit::new("x").unwrap()).unwrap();
    tokio::time::advance(Duration::from_millis(40)).await;
    assert_eq!(batcher.time_until_ready(), Some(Duration::from_millis(60)));

    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(batcher.time_until_ready(), Some(Duration::ZERO));
}

#[test]
fn test_closed_batcher_rejects_requests() {
    let batcher = Batcher::new(Duration::from_secs(1), 4);
    batcher.accept(RequestUnit::new("pending").unwrap()).unwrap();

    let last = batcher.close().expect("pending request flushed");
    assert_eq!(last.trigger(), SealReason::Flush);
    assert!(batcher.close().is_none());

    let err = batcher.accept(RequestUnit::new("late").unwrap()).unwrap_err();
    assert!(matches!(err, StreamBatchError::ShuttingDown));
    assert_eq!(batcher.pending(), 0);

    let unique: HashSet<_> = last.request_ids().into_iter().collect();
    assert_eq!(unique.len(), 1);
}
