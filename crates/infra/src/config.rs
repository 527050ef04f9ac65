//! Process-wide bus configuration.
//!
//! Loaded once at startup (`BusConfig::from_env`) and shared read-only by the
//! publisher, consumer and dead-letter services.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use streambus_events::RetryPolicy;

/// Path of an optional JSON config file.
pub const ENV_CONFIG_PATH: &str = "STREAMBUS_CONFIG";
pub const ENV_REDIS_URL: &str = "STREAMBUS_REDIS_URL";
/// Fallback shared with other services in the same deployment.
pub const ENV_REDIS_URL_FALLBACK: &str = "REDIS_URL";
/// Suffix appended to every consumer name so several processes can join the
/// same groups without colliding.
pub const ENV_CONSUMER_NAME: &str = "STREAMBUS_CONSUMER_NAME";

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One named stream and the group that consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub stream_name: String,
    pub consumer_group: String,
    /// Approximate cap applied on every append.
    pub max_length: u64,
}

impl StreamConfig {
    pub fn new(stream_name: impl Into<String>, consumer_group: impl Into<String>, max_length: u64) -> Self {
        Self {
            stream_name: stream_name.into(),
            consumer_group: consumer_group.into(),
            max_length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamsConfig {
    pub work_orders: StreamConfig,
    pub work_items: StreamConfig,
    pub attempts: StreamConfig,
    pub system: StreamConfig,
    pub dead_letter: StreamConfig,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            work_orders: StreamConfig::new("events:work-orders", "work-order-processors", 10_000),
            work_items: StreamConfig::new("events:work-items", "work-item-processors", 10_000),
            attempts: StreamConfig::new("events:attempts", "attempt-processors", 10_000),
            system: StreamConfig::new("events:system", "system-processors", 1_000),
            dead_letter: StreamConfig::new("events:dead-letter", "dead-letter-processors", 50_000),
        }
    }
}

impl StreamsConfig {
    /// The streams carrying live traffic (everything but the dead-letter stream).
    pub fn live(&self) -> [&StreamConfig; 4] {
        [&self.work_orders, &self.work_items, &self.attempts, &self.system]
    }

    /// Look up a live stream by its log name.
    pub fn find(&self, stream_name: &str) -> Option<&StreamConfig> {
        self.live().into_iter().find(|s| s.stream_name == stream_name)
    }
}

/// One consumer identity and the streams it reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    pub group_name: String,
    pub consumer_name: String,
    /// Log names of the streams read by this consumer.
    pub streams: Vec<String>,
    pub batch_size: usize,
    pub block_time_ms: u64,
    /// Retries after the first handler invocation.
    pub retry_attempts: u32,
    /// Linear backoff step: the n-th retry waits `retry_delay_ms × n`.
    pub retry_delay_ms: u64,
    /// Entries left pending this long by any consumer of the group are taken
    /// over by this one. `0` disables claiming.
    #[serde(default = "default_pending_claim_ms")]
    pub pending_claim_ms: u64,
}

fn default_pending_claim_ms() -> u64 {
    60_000
}

impl ConsumerConfig {
    pub fn new(group_name: impl Into<String>, consumer_name: impl Into<String>, streams: Vec<String>) -> Self {
        Self {
            group_name: group_name.into(),
            consumer_name: consumer_name.into(),
            streams,
            batch_size: 10,
            block_time_ms: 5_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            pending_claim_ms: default_pending_claim_ms(),
        }
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.retry_attempts, Duration::from_millis(self.retry_delay_ms))
    }

    /// Idle threshold for claiming other consumers' entries, if enabled.
    pub fn claim_idle(&self) -> Option<Duration> {
        (self.pending_claim_ms > 0).then(|| Duration::from_millis(self.pending_claim_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublisherConfig {
    /// Flush attempts after which a buffered event is marked permanently failed.
    pub outbox_max_retries: u32,
    pub flush_interval_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            outbox_max_retries: 5,
            flush_interval_ms: 5_000,
        }
    }
}

impl PublisherConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeadLetterConfig {
    /// Consumer name used when reading the dead-letter group for reprocessing.
    pub consumer_name: String,
    pub reprocess_retry_attempts: u32,
    pub reprocess_retry_delay_ms: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            consumer_name: "dead-letter-reprocessor".to_string(),
            reprocess_retry_attempts: 3,
            reprocess_retry_delay_ms: 1_000,
        }
    }
}

impl DeadLetterConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(
            self.reprocess_retry_attempts,
            Duration::from_millis(self.reprocess_retry_delay_ms),
        )
    }
}

/// Bus configuration shared by every service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    pub redis_url: String,
    pub streams: StreamsConfig,
    /// Consumer identities keyed by a descriptive name.
    pub consumers: BTreeMap<String, ConsumerConfig>,
    pub publisher: PublisherConfig,
    pub dead_letter: DeadLetterConfig,
    /// Pause after a consumer loop hits a transport error.
    pub error_backoff_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        let streams = StreamsConfig::default();

        let mut consumers = BTreeMap::new();
        for (name, consumer_name, stream) in [
            ("workOrders", "work-order-consumer-1", &streams.work_orders),
            ("workItems", "work-item-consumer-1", &streams.work_items),
            ("attempts", "attempt-consumer-1", &streams.attempts),
            ("system", "system-consumer-1", &streams.system),
        ] {
            consumers.insert(
                name.to_string(),
                ConsumerConfig::new(
                    stream.consumer_group.clone(),
                    consumer_name,
                    vec![stream.stream_name.clone()],
                ),
            );
        }

        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            streams,
            consumers,
            publisher: PublisherConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            error_backoff_ms: 5_000,
        }
    }
}

impl BusConfig {
    /// Defaults, overlaid with `STREAMBUS_CONFIG` (JSON) and then env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(ENV_CONFIG_PATH) {
            Some(path) => Self::from_file(PathBuf::from(path))?,
            None => Self::default(),
        };

        if let Some(url) = std::env::var(ENV_REDIS_URL)
            .ok()
            .or_else(|| std::env::var(ENV_REDIS_URL_FALLBACK).ok())
        {
            config.redis_url = url;
        }
        if let Ok(instance) = std::env::var(ENV_CONSUMER_NAME) {
            config.apply_instance_suffix(&instance);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Append `-<instance>` to every consumer name.
    pub fn apply_instance_suffix(&mut self, instance: &str) {
        let instance = instance.trim();
        if instance.is_empty() {
            return;
        }
        for consumer in self.consumers.values_mut() {
            consumer.consumer_name = format!("{}-{instance}", consumer.consumer_name);
        }
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Reject configurations the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut identities = std::collections::BTreeSet::new();

        for (name, consumer) in &self.consumers {
            if consumer.batch_size == 0 {
                return Err(ConfigError::Invalid(format!("consumer `{name}`: batchSize must be > 0")));
            }
            if consumer.streams.is_empty() {
                return Err(ConfigError::Invalid(format!("consumer `{name}`: no streams configured")));
            }
            if let Some(unknown) = consumer.streams.iter().find(|s| self.streams.find(s).is_none()) {
                return Err(ConfigError::Invalid(format!(
                    "consumer `{name}`: unknown stream `{unknown}`"
                )));
            }
            if !identities.insert((consumer.group_name.as_str(), consumer.consumer_name.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "consumer `{name}`: duplicate identity {}/{}",
                    consumer.group_name, consumer.consumer_name
                )));
            }
        }

        if self
            .streams
            .live()
            .iter()
            .any(|s| s.stream_name == self.streams.dead_letter.stream_name)
        {
            return Err(ConfigError::Invalid(
                "dead-letter stream must differ from every live stream".to_string(),
            ));
        }

        Ok(())
    }

    /// Defaults with timings short enough for tests.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let mut config = Self::default();
        for consumer in config.consumers.values_mut() {
            consumer.block_time_ms = 20;
            consumer.retry_delay_ms = 1;
        }
        config.error_backoff_ms = 10;
        config.publisher.flush_interval_ms = 20;
        config.dead_letter.reprocess_retry_delay_ms = 1;
        config
    }
}
