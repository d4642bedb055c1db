use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::batch::RequestUnit;
use crate::queue::{QueueError, UpstreamQueue};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<RequestUnit>,
    in_flight: HashMap<Uuid, RequestUnit>,
    acknowledged: HashSet<Uuid>,
    closed: bool,
}

/// In-process upstream queue
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
    /// An empty, open queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request
    pub fn push(&self, unit: RequestUnit) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.pending.push_back(unit);
        Ok(())
    }

    /// Requests not yet fetched
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Requests fetched but not acknowledged
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Whether `id` has been acknowledged
    pub fn is_acknowledged(&self, id: Uuid) -> bool {
        self.state.lock().acknowledged.contains(&id)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl UpstreamQueue for MemoryQueue {
    async fn fetch(&self, max_batch: usize) -> Result<Vec<RequestUnit>, QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let take = max_batch.min(state.pending.len());
        let fetched: Vec<RequestUnit> = state.pending.drain(..take).collect();
        for unit in &fetched {
            state.in_flight.insert(unit.id(), unit.clone());
        }
        Ok(fetched)
    }

    async fn acknowledge(&self, ids: &[Uuid]) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        for id in ids {
            state.in_flight.remove(id);
            state.acknowledged.insert(*id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.state.lock().closed = true;
        Ok(())
    }
}
