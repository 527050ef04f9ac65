//! Infrastructure layer: stream log backends, configuration and the bus services.
//!
//! - [`stream_log`]: the append-only log abstraction (Redis Streams, in-memory)
//! - [`publisher`]: validated publishing with a local outbox
//! - [`consumer`]: consumer-group loops, handler dispatch, quarantine
//! - [`dead_letter`]: dead-letter inspection, reprocessing and retention

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod publisher;
pub mod stream_log;

mod integration_tests;

pub use config::{BusConfig, ConfigError, ConsumerConfig, DeadLetterConfig, PublisherConfig, StreamConfig, StreamsConfig};
pub use consumer::{ConsumerError, ConsumerHealth, ConsumerStats, Disposition, EventConsumerService};
pub use dead_letter::{DeadLetterError, DeadLetterHealth, DeadLetterService, DeadLetterStats, ReprocessReport};
pub use publisher::{
    EventPublisher, FlushReport, OutboxEntry, OutboxStatus, PublishError, PublishReceipt, PublisherHealth,
};
pub use stream_log::{GroupCreation, GroupInfo, InMemoryStreamLog, LogConnector, LogError, ReadFrom, StreamInfo, StreamLog};
#[cfg(feature = "redis")]
pub use stream_log::{RedisConnector, RedisStreamLog};
