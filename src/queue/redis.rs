//! Redis-backed upstream queue using a pending list and a processing list.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Direction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::RequestUnit;
use crate::config::RedisConfig;
use crate::queue::{QueueError, UpstreamQueue};

/// Redis list-backed upstream queue.
///
/// `fetch` moves entries atomically from the queue list to a processing list,
/// so a crash between fetch and acknowledge leaves them recoverable.
pub struct RedisQueue {
    connection: ConnectionManager,
    config: RedisConfig,
    // Raw payload of every fetched, unacknowledged request.
    in_flight: DashMap<Uuid, String>,
    closed: AtomicBool,
}

impl RedisQueue {
    /// Connect to Redis
    pub async fn new(config: RedisConfig) -> Result<Self, QueueError> {
        let client = Client::open(config.redis_url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        info!(
            redis_url = %config.redis_url,
            queue = %config.queue_key,
            "Connected Redis upstream queue"
        );

        Ok(Self {
            connection,
            config,
            in_flight: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn queue_key(&self) -> String {
        self.config.key(&self.config.queue_key)
    }

    fn processing_key(&self) -> String {
        self.config.key(&self.config.processing_key)
    }

    fn processed_key(&self) -> String {
        self.config.key(&self.config.processed_key)
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Enqueue a request at the tail
    pub async fn push(&self, unit: &RequestUnit) -> Result<(), QueueError> {
        self.ensure_open()?;
        let payload = serde_json::to_string(unit)?;
        let mut conn = self.connection.clone();
        let _: () = conn.rpush(self.queue_key(), payload).await?;
        Ok(())
    }

    /// Number of requests waiting in the queue list
    pub async fn pending_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection.clone();
        Ok(conn.llen(self.queue_key()).await?)
    }

    /// Requests fetched but not acknowledged yet
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

/// Settle a fetch interrupted by a Redis error.
///
/// Entries already moved to the processing list are returned so they reach
/// a batch; the error only surfaces when nothing was fetched.
fn partial_fetch(
    fetched: Vec<RequestUnit>,
    error: QueueError,
) -> Result<Vec<RequestUnit>, QueueError> {
    if fetched.is_empty() {
        return Err(error);
    }
    warn!(
        error = %error,
        fetched = fetched.len(),
        "Queue read interrupted, keeping requests fetched so far"
    );
    Ok(fetched)
}

#[async_trait]
impl UpstreamQueue for RedisQueue {
    async fn fetch(&self, max_batch: usize) -> Result<Vec<RequestUnit>, QueueError> {
        self.ensure_open()?;
        let mut conn = self.connection.clone();
        let queue_key = self.queue_key();
        let processing_key = self.processing_key();
        let mut fetched = Vec::new();

        while fetched.len() < max_batch {
            let moved: redis::RedisResult<Option<String>> = conn
                .lmove(&queue_key, &processing_key, Direction::Left, Direction::Right)
                .await;
            let raw = match moved {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => return partial_fetch(fetched, e.into()),
            };

            match serde_json::from_str::<RequestUnit>(&raw) {
                Ok(unit) => {
                    self.in_flight.insert(unit.id(), raw);
                    fetched.push(unit);
                }
                Err(e) => {
                    warn!(error = %e, "Dropping malformed queue entry");
                    let removed: redis::RedisResult<()> = conn.lrem(&processing_key, 1, &raw).await;
                    if let Err(e) = removed {
                        warn!(error = %e, "Malformed entry left in processing list");
                    }
                }
            }
        }

        if !fetched.is_empty() {
            debug!(count = fetched.len(), "Fetched requests from Redis queue");
        }
        Ok(fetched)
    }

    async fn acknowledge(&self, ids: &[Uuid]) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut conn = self.connection.clone();
        let processing_key = self.processing_key();
        let processed_key = self.processed_key();

        for id in ids {
            // Requests submitted directly never went through this queue.
            let Some(raw) = self.in_flight.get(id).map(|entry| entry.value().clone()) else {
                continue;
            };
            let _: () = conn.lrem(&processing_key, 1, raw).await?;
            let _: () = conn.sadd(&processed_key, id.to_string()).await?;
            // Forgotten only after both writes succeed.
            self.in_flight.remove(id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(
                unacknowledged = self.in_flight.len(),
                "Closing Redis upstream queue"
            );
        }
        Ok(())
    }
}
