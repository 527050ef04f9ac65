//! Append-only log substrate with consumer groups.
//!
//! The bus never talks to a broker directly; it goes through [`StreamLog`].
//! Two backends exist:
//!
//! - **Redis Streams** (`redis` feature): `XADD`/`XREADGROUP`/`XACK`, the
//!   production substrate.
//! - **In-memory**: the same group semantics in-process, for tests and dev.
//!   It can be switched "offline" to simulate a broker outage.
//!
//! ## Group semantics both backends honour
//!
//! - A group is created at `0-0`, so it sees the whole log.
//! - `ReadFrom::New` hands out entries never delivered to the group and moves
//!   them into the reading consumer's pending set.
//! - `ReadFrom::Pending` re-delivers the consumer's own unacknowledged
//!   entries (after a crash, or after a failed batch). An entry trimmed from
//!   the log while pending comes back with an empty field list.
//! - `claim_stale` moves entries pending longer than an idle threshold, whoever
//!   owns them, to the claiming consumer. A consumer that went away for good
//!   therefore does not strand its entries.
//! - `ack` removes entries from the pending set; acknowledging twice counts once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use streambus_core::EntryId;
use streambus_events::{StreamEntry, StreamFields};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::InMemoryStreamLog;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisConnector, RedisStreamLog};

/// Transport-level failure talking to the log.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LogError {
    /// The substrate could not be reached (connection refused, dropped, timed out).
    #[error("log unavailable: {0}")]
    Unavailable(String),

    /// The substrate rejected a command.
    #[error("log command failed: {0}")]
    Command(String),

    /// The substrate answered with something we could not interpret.
    #[error("unexpected log reply: {0}")]
    Protocol(String),
}

/// Result of an idempotent group creation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// Which entries a group read should return.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries never delivered to the group (blocking up to the given time).
    New,
    /// The calling consumer's own delivered-but-unacknowledged entries.
    Pending,
}

/// Consumer-group metadata for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
    pub last_delivered_id: EntryId,
}

/// Stream-level metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub length: u64,
    pub first_entry_id: Option<EntryId>,
    pub last_entry_id: Option<EntryId>,
}

/// One connection to the log.
///
/// Implementations must not be shared between consumer loops: a blocking
/// group read occupies the connection until it returns.
#[async_trait]
pub trait StreamLog: Send + Sync {
    async fn ping(&self) -> Result<(), LogError>;

    /// Create `group` on `stream` (creating the stream too) unless it exists.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupCreation, LogError>;

    /// Append an entry; the log assigns the id. `max_len` caps the stream
    /// length by evicting the oldest entries.
    async fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        max_len: Option<u64>,
    ) -> Result<EntryId, LogError>;

    /// Read up to `count` entries across `streams` as `consumer` of `group`.
    ///
    /// For `ReadFrom::New`, waits up to `block` when nothing is available;
    /// a zero `block` never waits.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, LogError>;

    /// Take over up to `count` entries of `group` on `stream` that have been
    /// pending for at least `min_idle`, and deliver them to `consumer`.
    ///
    /// Entries trimmed from the log while pending are dropped from the
    /// pending set instead of being returned.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, LogError>;

    /// Acknowledge entries; returns how many were actually pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, LogError>;

    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>, LogError>;

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, LogError>;

    /// Up to `count` entries, oldest first, without touching any group.
    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, LogError>;

    /// Remove every entry with an id lower than `min_id`; returns the number removed.
    async fn trim_before(&self, stream: &str, min_id: EntryId) -> Result<u64, LogError>;
}

/// Hands out independent connections.
#[async_trait]
pub trait LogConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StreamLog>, LogError>;
}
