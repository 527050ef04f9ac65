//! Redis Streams-backed stream log (durable, at-least-once delivery).
//!
//! Command mapping:
//!
//! | operation      | command                                   |
//! |----------------|-------------------------------------------|
//! | `ensure_group` | `XGROUP CREATE <stream> <group> 0 MKSTREAM` (`BUSYGROUP` = exists) |
//! | `append`       | `XADD <stream> MAXLEN ~ <n> * field value …` |
//! | `read_group`   | `XREADGROUP GROUP <g> <c> COUNT <n> [BLOCK <ms>] STREAMS … >` (or `0` for own pending) |
//! | `claim_stale`  | `XAUTOCLAIM <stream> <group> <consumer> <min-idle-ms> 0-0 COUNT <n>` |
//! | `ack`          | `XACK`                                    |
//! | `group_info`   | `XINFO GROUPS`                            |
//! | `stream_info`  | `XLEN` + `XRANGE … COUNT 1` + `XREVRANGE … COUNT 1` |
//! | `trim_before`  | `XTRIM <stream> MINID <id>`               |
//!
//! Each [`RedisStreamLog`] wraps its own `ConnectionManager`, which reconnects
//! transparently after the server comes back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamId, StreamInfoGroupsReply, StreamMaxlen, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError, Value};
use tracing::{debug, instrument};

use streambus_core::EntryId;
use streambus_events::{StreamEntry, StreamFields};

use super::{GroupCreation, GroupInfo, LogConnector, LogError, ReadFrom, StreamInfo, StreamLog};

impl From<RedisError> for LogError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            LogError::Unavailable(err.to_string())
        } else {
            LogError::Command(err.to_string())
        }
    }
}

/// Opens [`RedisStreamLog`] connections against one server.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LogError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LogError::Command(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LogConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn StreamLog>, LogError> {
        let conn = ConnectionManager::new(self.client.clone()).await?;
        Ok(Arc::new(RedisStreamLog { conn }))
    }
}

/// One Redis connection speaking the stream commands.
#[derive(Clone)]
pub struct RedisStreamLog {
    conn: ConnectionManager,
}

impl RedisStreamLog {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn parse_id(raw: &str) -> Result<EntryId, LogError> {
    raw.parse::<EntryId>()
        .map_err(|e| LogError::Protocol(e.to_string()))
}

fn decode_entry(stream: &str, raw: StreamId) -> Result<StreamEntry, LogError> {
    let id = parse_id(&raw.id)?;
    let mut fields: Vec<(String, String)> = Vec::with_capacity(raw.map.len());
    for (field, value) in raw.map {
        let value = match value {
            Value::Nil => continue,
            other => redis::from_redis_value::<String>(&other)
                .map_err(|e| LogError::Protocol(format!("field `{field}`: {e}")))?,
        };
        fields.push((field, value));
    }
    Ok(StreamEntry::new(id, stream, fields.into_iter().collect()))
}

/// Entries from an `XAUTOCLAIM` reply: `[next-cursor, [[id, [field, value, …]], …], …]`.
fn decode_claimed(stream: &str, reply: &Value) -> Result<Vec<StreamEntry>, LogError> {
    let claimed = match reply {
        Value::Bulk(parts) => parts.get(1),
        _ => None,
    };
    let Some(Value::Bulk(rows)) = claimed else {
        return Err(LogError::Protocol(format!("malformed XAUTOCLAIM reply: {reply:?}")));
    };

    let mut batch = Vec::with_capacity(rows.len());
    for row in rows {
        let Value::Bulk(pair) = row else {
            return Err(LogError::Protocol(format!("malformed claimed entry: {row:?}")));
        };
        let [id, fields] = pair.as_slice() else {
            return Err(LogError::Protocol(format!("malformed claimed entry: {row:?}")));
        };
        // Redis 6.2 reports entries deleted while pending with nil fields.
        if matches!(fields, Value::Nil) {
            continue;
        }
        let id: String = redis::from_redis_value(id).map_err(|e| LogError::Protocol(e.to_string()))?;
        let map: HashMap<String, Value> =
            redis::from_redis_value(fields).map_err(|e| LogError::Protocol(e.to_string()))?;
        batch.push(decode_entry(stream, StreamId { id, map })?);
    }
    Ok(batch)
}

fn is_missing_key(err: &RedisError) -> bool {
    err.to_string().contains("no such key")
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn ping(&self) -> Result<(), LogError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupCreation, LogError> {
        let mut conn = self.conn.clone();
        // "0": the group starts from the beginning of the stream.
        let created: Result<String, RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;

        match created {
            Ok(_) => Ok(GroupCreation::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        max_len: Option<u64>,
    ) -> Result<EntryId, LogError> {
        let mut conn = self.conn.clone();
        let items: Vec<(&str, &str)> = fields.iter().collect();

        let id: String = match max_len {
            Some(n) => {
                let cap = usize::try_from(n).unwrap_or(usize::MAX);
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(cap), "*", items.as_slice())
                    .await?
            }
            None => conn.xadd(stream, "*", items.as_slice()).await?,
        };
        parse_id(&id)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, LogError> {
        if streams.is_empty() || count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut opts = StreamReadOptions::default().group(group, consumer).count(count);
        // BLOCK 0 would wait forever; a zero duration means "don't block".
        if from == ReadFrom::New && !block.is_zero() {
            opts = opts.block(usize::try_from(block.as_millis()).unwrap_or(usize::MAX));
        }

        let cursor = match from {
            ReadFrom::New => ">",
            ReadFrom::Pending => "0",
        };
        let ids = vec![cursor; streams.len()];

        // Nil reply when the block timeout expires.
        let reply: Option<StreamReadReply> = conn.xread_options(streams, ids.as_slice(), &opts).await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        for key in reply.keys {
            for raw in key.ids {
                batch.push(decode_entry(&key.key, raw)?);
            }
        }
        debug!(group, consumer, count = batch.len(), ?from, "read batch");
        Ok(batch)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX))
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let batch = decode_claimed(stream, &reply)?;
        if !batch.is_empty() {
            debug!(stream, group, consumer, count = batch.len(), "claimed stale entries");
        }
        Ok(batch)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, LogError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let acked: u64 = conn.xack(stream, group, ids.as_slice()).await?;
        Ok(acked)
    }

    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>, LogError> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoGroupsReply = conn.xinfo_groups(stream).await?;

        reply
            .groups
            .into_iter()
            .map(|g| {
                Ok(GroupInfo {
                    name: g.name,
                    consumers: g.consumers as u64,
                    pending: g.pending as u64,
                    last_delivered_id: parse_id(&g.last_delivered_id)?,
                })
            })
            .collect()
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, LogError> {
        let mut conn = self.conn.clone();

        let length: u64 = match conn.xlen(stream).await {
            Ok(n) => n,
            Err(e) if is_missing_key(&e) => return Ok(StreamInfo::default()),
            Err(e) => return Err(e.into()),
        };
        if length == 0 {
            return Ok(StreamInfo::default());
        }

        let first: StreamRangeReply = conn.xrange_count(stream, "-", "+", 1).await?;
        let last: StreamRangeReply = conn.xrevrange_count(stream, "+", "-", 1).await?;

        Ok(StreamInfo {
            length,
            first_entry_id: first.ids.first().map(|s| parse_id(&s.id)).transpose()?,
            last_entry_id: last.ids.first().map(|s| parse_id(&s.id)).transpose()?,
        })
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, LogError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrange_count(stream, "-", "+", count).await?;
        reply
            .ids
            .into_iter()
            .map(|raw| decode_entry(stream, raw))
            .collect()
    }

    #[instrument(skip(self), fields(min_id = %min_id))]
    async fn trim_before(&self, stream: &str, min_id: EntryId) -> Result<u64, LogError> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("XTRIM")
            .arg(stream)
            .arg("MINID")
            .arg(min_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}
