//! Configuration for batching, execution limits and the Redis backends.
//!
//! Values come from [`Default`], the builder-style `with_*` setters, or the
//! process environment through [`BatchingConfig::from_env`].

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or loading configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of its allowed range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Name of the offending setting
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// An environment variable could not be parsed
    #[error("Could not parse {field}={value}")]
    Parse {
        /// Environment variable name
        field: String,
        /// Raw value that failed to parse
        value: String,
    },
}

/// Limits and timings that drive the batcher, executors and manager
#[derive(Debug, Clone, PartialEq)]
pub struct BatchingConfig {
    /// Maximum age of a batch before it is sealed regardless of size
    pub batch_window: Duration,
    /// Size at which a batch is sealed immediately
    pub max_requests_per_batch: usize,
    /// Worker budget of a single batch executor
    pub max_concurrent_requests_per_batch: usize,
    /// Number of batch executors allowed to run at once
    pub max_concurrent_batches: usize,
    /// Upper bound on how long the manager loop idles between readiness checks
    pub tick_interval: Duration,
    /// Attempts per sink write before a request is failed
    pub sink_retry_attempts: u32,
    /// Base delay between sink write attempts, doubled per attempt
    pub sink_retry_delay: Duration,
    /// Capacity of the batch outcome broadcast channel
    pub outcome_buffer: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(250),
            max_requests_per_batch: 4,
            max_concurrent_requests_per_batch: 4,
            max_concurrent_batches: 5,
            tick_interval: Duration::from_millis(25),
            sink_retry_attempts: 3,
            sink_retry_delay: Duration::from_millis(10),
            outcome_buffer: 256,
        }
    }
}

impl BatchingConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch window
    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    /// Set the size trigger
    pub fn with_max_requests_per_batch(mut self, max: usize) -> Self {
        self.max_requests_per_batch = max;
        self
    }

    /// Set the per-batch worker budget
    pub fn with_max_concurrent_requests_per_batch(mut self, max: usize) -> Self {
        self.max_concurrent_requests_per_batch = max;
        self
    }

    /// Set the global ceiling on running batches
    pub fn with_max_concurrent_batches(mut self, max: usize) -> Self {
        self.max_concurrent_batches = max;
        self
    }

    /// Set the manager loop tick
    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    /// Set the sink retry policy
    pub fn with_sink_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.sink_retry_attempts = attempts;
        self.sink_retry_delay = delay;
        self
    }

    /// Set the outcome channel capacity
    pub fn with_outcome_buffer(mut self, capacity: usize) -> Self {
        self.outcome_buffer = capacity;
        self
    }

    /// Check every limit is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_window.is_zero() {
            return Err(invalid("batch_window", "must be greater than zero"));
        }
        if self.max_requests_per_batch == 0 {
            return Err(invalid("max_requests_per_batch", "must be at least 1"));
        }
        if self.max_concurrent_requests_per_batch == 0 {
            return Err(invalid("max_concurrent_requests_per_batch", "must be at least 1"));
        }
        if self.max_concurrent_batches == 0 {
            return Err(invalid("max_concurrent_batches", "must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(invalid("tick_interval", "must be greater than zero"));
        }
        if self.sink_retry_attempts == 0 {
            return Err(invalid("sink_retry_attempts", "must be at least 1"));
        }
        if self.outcome_buffer == 0 {
            return Err(invalid("outcome_buffer", "must be at least 1"));
        }
        Ok(())
    }

    /// Load from the process environment on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup on top of the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, &["BATCH_WINDOW_MS"])? {
            config.batch_window = Duration::from_millis(ms);
        }
        if let Some(max) =
            parse_var(&lookup, &["MAX_REQUESTS_PER_BATCH", "MAX_REQUESTS_PER_JOB"])?
        {
            config.max_requests_per_batch = max;
        }
        if let Some(max) = parse_var(&lookup, &["MAX_CONCURRENT_REQUESTS_PER_BATCH"])? {
            config.max_concurrent_requests_per_batch = max;
        }
        if let Some(max) = parse_var(&lookup, &["MAX_CONCURRENT_BATCHES"])? {
            config.max_concurrent_batches = max;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, &["TICK_INTERVAL_MS"])? {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var(&lookup, &["SINK_RETRY_ATTEMPTS"])? {
            config.sink_retry_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, &["SINK_RETRY_DELAY_MS"])? {
            config.sink_retry_delay = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var(&lookup, &["OUTCOME_BUFFER"])? {
            config.outcome_buffer = capacity;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Redis configuration shared by the result sink and the upstream queue
#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    /// Connection URL
    pub redis_url: String,
    /// Prefix for every key
    pub key_prefix: String,
    /// Expiry of result keys in seconds
    pub key_ttl_secs: u64,
    /// List holding pending requests
    pub queue_key: String,
    /// List holding fetched, unacknowledged requests
    pub processing_key: String,
    /// Set of acknowledged request ids
    pub processed_key: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "streambatch:".to_string(),
            key_ttl_secs: 86400, // 24 hours
            queue_key: "text_generation_queue".to_string(),
            processing_key: "processing_requests".to_string(),
            processed_key: "processed_requests".to_string(),
        }
    }
}

impl RedisConfig {
    /// Load from the process environment on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup on top of the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(prefix) = lookup("REDIS_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(queue) = lookup("REDIS_QUEUE_NAME") {
            config.queue_key = queue;
        }
        if let Some(ttl) = parse_var(&lookup, &["REDIS_KEY_TTL_SECS"])? {
            config.key_ttl_secs = ttl;
        }
        if config.key_ttl_secs == 0 {
            return Err(invalid("key_ttl_secs", "must be greater than zero"));
        }
        Ok(config)
    }

    /// Full key for a namespaced name
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

// First key present wins.
fn parse_var<T, F>(lookup: &F, keys: &[&str]) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(raw) = lookup(key) {
            return raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Parse {
                    field: key.to_string(),
                    value: raw,
                });
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = BatchingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_window, Duration::from_millis(250));
        assert_eq!(config.max_requests_per_batch, 4);
        assert_eq!(config.max_concurrent_batches, 5);
    }

    #[test]
    fn test_builder_configuration() {
        let config = BatchingConfig::new()
            .with_batch_window(Duration::from_millis(100))
            .with_max_requests_per_batch(8)
            .with_max_concurrent_requests_per_batch(2)
            .with_max_concurrent_batches(3);

        assert_eq!(config.batch_window, Duration::from_millis(100));
        assert_eq!(config.max_requests_per_batch, 8);
        assert_eq!(config.max_concurrent_requests_per_batch, 2);
        assert_eq!(config.max_concurrent_batches, 3);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let err = BatchingConfig::new()
            .with_max_concurrent_batches(0)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "max_concurrent_batches", .. }
        ));

        assert!(BatchingConfig::new()
            .with_max_requests_per_batch(0)
            .validate()
            .is_err());
        assert!(BatchingConfig::new()
            .with_batch_window(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_lookup_overrides_defaults() {
        let config = BatchingConfig::from_lookup(lookup_from(&[
            ("BATCH_WINDOW_MS", "500"),
            ("MAX_REQUESTS_PER_JOB", "10"),
            ("MAX_CONCURRENT_BATCHES", " 2 "),
        ]))
        .unwrap();

        assert_eq!(config.batch_window, Duration::from_millis(500));
        assert_eq!(config.max_requests_per_batch, 10);
        assert_eq!(config.max_concurrent_batches, 2);
        assert_eq!(config.max_concurrent_requests_per_batch, 4);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = BatchingConfig::from_lookup(lookup_from(&[("BATCH_WINDOW_MS", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                field: "BATCH_WINDOW_MS".to_string(),
                value: "soon".to_string(),
            }
        );

        assert!(BatchingConfig::from_lookup(lookup_from(&[("MAX_CONCURRENT_BATCHES", "0")]))
            .is_err());
    }

    #[test]
    fn test_redis_config_keys() {
        let config = RedisConfig::from_lookup(lookup_from(&[
            ("REDIS_URL", "redis://cache:6380"),
            ("REDIS_KEY_PREFIX", "gen:"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.key("status:abc"), "gen:status:abc");
        assert_eq!(config.queue_key, "text_generation_queue");
    }
}
