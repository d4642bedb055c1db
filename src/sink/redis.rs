//! Redis-backed result sink. Every key carries the configured TTL.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RedisConfig;
use crate::sink::{RequestStatus, ResultMetadata, ResultSink, SinkError};

// KEYS: content, status, metadata. ARGV: in-progress status, ttl.
const INIT_SCRIPT: &str = r#"
local status = redis.call('GET', KEYS[2])
if status == 'completed' or status == 'failed' then
    return 0
end
redis.call('SET', KEYS[1], '', 'EX', ARGV[2])
redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[2])
redis.call('DEL', KEYS[3])
return 1
"#;

// KEYS: content, status. ARGV: fragment, ttl.
const APPEND_SCRIPT: &str = r#"
local status = redis.call('GET', KEYS[2])
if status == 'completed' or status == 'failed' then
    return 0
end
redis.call('APPEND', KEYS[1], ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 1
"#;

// KEYS: status, payload. ARGV: new status, payload value, ttl.
const TRANSITION_SCRIPT: &str = r#"
local status = redis.call('GET', KEYS[1])
if status == 'completed' or status == 'failed' then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
return 1
"#;

/// Redis-backed result sink
pub struct RedisSink {
    connection: ConnectionManager,
    config: RedisConfig,
    init_script: Script,
    append_script: Script,
    transition_script: Script,
}

impl RedisSink {
    /// Connect to Redis
    pub async fn new(config: RedisConfig) -> Result<Self, SinkError> {
        let client = Client::open(config.redis_url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        info!(redis_url = %config.redis_url, "Connected Redis result sink");

        Ok(Self {
            connection,
            config,
            init_script: Script::new(INIT_SCRIPT),
            append_script: Script::new(APPEND_SCRIPT),
            transition_script: Script::new(TRANSITION_SCRIPT),
        })
    }

    fn content_key(&self, id: Uuid) -> String {
        self.config.key(&format!("response:{id}"))
    }

    fn status_key(&self, id: Uuid) -> String {
        self.config.key(&format!("status:{id}"))
    }

    fn metadata_key(&self, id: Uuid) -> String {
        self.config.key(&format!("meta:{id}"))
    }

    async fn transition(
        &self,
        id: Uuid,
        status: RequestStatus,
        payload_key: String,
        payload: String,
    ) -> Result<bool, SinkError> {
        let mut conn = self.connection.clone();
        let applied: i32 = self
            .transition_script
            .key(self.status_key(id))
            .key(payload_key)
            .arg(status.as_str())
            .arg(payload)
            .arg(self.config.key_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    /// Metadata recorded by `finalize`
    pub async fn metadata(&self, id: Uuid) -> Result<Option<ResultMetadata>, SinkError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.metadata_key(id)).await?;
        raw.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(SinkError::from)
    }
}

#[async_trait]
impl ResultSink for RedisSink {
    async fn initialize(&self, id: Uuid) -> Result<(), SinkError> {
        let mut conn = self.connection.clone();
        let applied: i32 = self
            .init_script
            .key(self.content_key(id))
            .key(self.status_key(id))
            .key(self.metadata_key(id))
            .arg(RequestStatus::InProgress.as_str())
            .arg(self.config.key_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        if applied == 0 {
            return Err(SinkError::AlreadyTerminal(id));
        }
        Ok(())
    }

    async fn append(&self, id: Uuid, fragment: &str) -> Result<(), SinkError> {
        let mut conn = self.connection.clone();
        let applied: i32 = self
            .append_script
            .key(self.content_key(id))
            .key(self.status_key(id))
            .arg(fragment)
            .arg(self.config.key_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        if applied == 0 {
            return Err(SinkError::AlreadyTerminal(id));
        }
        Ok(())
    }

    async fn finalize(&self, id: Uuid, metadata: &ResultMetadata) -> Result<(), SinkError> {
        let payload = serde_json::to_string(metadata)?;
        if !self
            .transition(id, RequestStatus::Completed, self.metadata_key(id), payload)
            .await?
        {
            debug!(request_id = %id, "Ignoring finalize on terminal request");
        }
        Ok(())
    }

    async fn mark_error(&self, id: Uuid, message: &str) -> Result<(), SinkError> {
        let payload = format!("Error: {message}");
        if !self
            .transition(id, RequestStatus::Failed, self.content_key(id), payload)
            .await?
        {
            debug!(request_id = %id, "Ignoring error on terminal request");
        }
        Ok(())
    }

    async fn get_status(&self, id: Uuid) -> Result<RequestStatus, SinkError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.status_key(id)).await?;
        Ok(raw
            .and_then(|status| status.parse().ok())
            .unwrap_or(RequestStatus::InProgress))
    }

    async fn get_content(&self, id: Uuid) -> Result<Option<String>, SinkError> {
        let mut conn = self.connection.clone();
        Ok(conn.get(self.content_key(id)).await?)
    }

    async fn close(&self) -> Result<(), SinkError> {
        info!("Closing Redis result sink");
        Ok(())
    }
}
