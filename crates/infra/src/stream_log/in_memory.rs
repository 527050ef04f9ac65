use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use streambus_core::EntryId;
use streambus_events::{StreamEntry, StreamFields};

use super::{GroupCreation, GroupInfo, LogConnector, LogError, ReadFrom, StreamInfo, StreamLog};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    deliveries: u32,
    delivered_at: Instant,
}

impl PendingEntry {
    fn first(consumer: &str) -> Self {
        Self {
            consumer: consumer.to_string(),
            deliveries: 1,
            delivered_at: Instant::now(),
        }
    }

    fn redeliver(&mut self) {
        self.deliveries += 1;
        self.delivered_at = Instant::now();
    }
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    consumers: BTreeSet<String>,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, StreamFields>,
    last_id: EntryId,
    groups: BTreeMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Shared {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
    offline: AtomicBool,
}

/// In-process stream log with consumer-group semantics.
///
/// Intended for tests/dev. Clones share the same log, so the value doubles as
/// its own [`LogConnector`]. [`set_available(false)`](Self::set_available)
/// makes every call fail with [`LogError::Unavailable`] until switched back.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStreamLog {
    shared: Arc<Shared>,
}

impl InMemoryStreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.shared.offline.store(!available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        !self.shared.offline.load(Ordering::SeqCst)
    }

    /// Pending entry ids of `group` on `stream`, with the owning consumer and
    /// delivery count.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<(EntryId, String, u32)> {
        let streams = self.lock();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, p)| (*id, p.consumer.clone(), p.deliveries))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.shared.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), LogError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(LogError::Unavailable("in-memory log is offline".to_string()))
        }
    }

    fn collect_new(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let mut state = self.lock();
        let mut batch = Vec::new();

        for name in streams {
            let stream = state.get_mut(name).ok_or_else(|| no_group(name, group))?;
            let StreamState { entries, groups, .. } = stream;
            let group_state = groups.get_mut(group).ok_or_else(|| no_group(name, group))?;
            group_state.consumers.insert(consumer.to_string());

            let remaining = count.saturating_sub(batch.len());
            let start = group_state.last_delivered;
            let fresh: Vec<(EntryId, StreamFields)> = entries
                .range(start..)
                .filter(|(id, _)| **id > start)
                .take(remaining)
                .map(|(id, fields)| (*id, fields.clone()))
                .collect();

            for (id, fields) in fresh {
                group_state.last_delivered = id;
                group_state.pending.insert(id, PendingEntry::first(consumer));
                batch.push(StreamEntry::new(id, name.as_str(), fields));
            }

            if batch.len() >= count {
                break;
            }
        }

        Ok(batch)
    }

    fn collect_pending(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let mut state = self.lock();
        let mut batch = Vec::new();

        for name in streams {
            let stream = state.get_mut(name).ok_or_else(|| no_group(name, group))?;
            let StreamState { entries, groups, .. } = stream;
            let group_state = groups.get_mut(group).ok_or_else(|| no_group(name, group))?;
            group_state.consumers.insert(consumer.to_string());

            for (id, pending) in group_state.pending.iter_mut() {
                if batch.len() >= count {
                    break;
                }
                if pending.consumer != consumer {
                    continue;
                }
                pending.redeliver();
                // Trimmed while pending: delivered with no fields.
                let fields = entries.get(id).cloned().unwrap_or_default();
                batch.push(StreamEntry::new(*id, name.as_str(), fields));
            }
        }

        Ok(batch)
    }
}

fn no_group(stream: &str, group: &str) -> LogError {
    LogError::Command(format!(
        "NOGROUP no such key '{stream}' or consumer group '{group}'"
    ))
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[async_trait]
impl StreamLog for InMemoryStreamLog {
    async fn ping(&self) -> Result<(), LogError> {
        self.check_available()
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupCreation, LogError> {
        self.check_available()?;
        let mut state = self.lock();
        let stream_state = state.entry(stream.to_string()).or_default();

        if stream_state.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        // Starts at `0-0`: the group sees the whole log.
        stream_state.groups.insert(group.to_string(), GroupState::default());
        Ok(GroupCreation::Created)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        max_len: Option<u64>,
    ) -> Result<EntryId, LogError> {
        self.check_available()?;
        if fields.is_empty() {
            return Err(LogError::Command("ERR wrong number of arguments for 'xadd'".to_string()));
        }

        let id = {
            let mut state = self.lock();
            let stream_state = state.entry(stream.to_string()).or_default();
            let id = stream_state.last_id.next(now_millis());
            stream_state.last_id = id;
            stream_state.entries.insert(id, fields.clone());

            if let Some(max_len) = max_len {
                while stream_state.entries.len() as u64 > max_len {
                    if stream_state.entries.pop_first().is_none() {
                        break;
                    }
                }
            }
            id
        };

        self.shared.appended.notify_waiters();
        Ok(id)
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
        self.check_available()?;
        if count == 0 {
            return Ok(Vec::new());
        }

        if from == ReadFrom::Pending {
            return self.collect_pending(group, consumer, streams, count);
        }

        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Register interest before looking so an append between the check
            // and the wait is not missed.
            let notified = self.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.collect_new(group, consumer, streams, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
            self.check_available()?;
        }
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        self.check_available()?;
        let mut state = self.lock();
        let stream_state = state.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let StreamState { entries, groups, .. } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        group_state.consumers.insert(consumer.to_string());

        let now = Instant::now();
        let stale: Vec<EntryId> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        let mut batch = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(fields) = entries.get(&id).cloned() else {
                group_state.pending.remove(&id);
                continue;
            };
            if let Some(pending) = group_state.pending.get_mut(&id) {
                pending.consumer = consumer.to_string();
                pending.redeliver();
            }
            batch.push(StreamEntry::new(id, stream, fields));
        }
        Ok(batch)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, LogError> {
        self.check_available()?;
        let mut state = self.lock();
        let Some(group_state) = state.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };

        let acked = ids
            .iter()
            .filter(|id| group_state.pending.remove(id).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>, LogError> {
        self.check_available()?;
        let state = self.lock();
        let stream_state = state
            .get(stream)
            .ok_or_else(|| LogError::Command("ERR no such key".to_string()))?;

        Ok(stream_state
            .groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                consumers: g.consumers.len() as u64,
                pending: g.pending.len() as u64,
                last_delivered_id: g.last_delivered,
            })
            .collect())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, LogError> {
        self.check_available()?;
        let state = self.lock();
        Ok(state
            .get(stream)
            .map(|s| StreamInfo {
                length: s.entries.len() as u64,
                first_entry_id: s.entries.keys().next().copied(),
                last_entry_id: s.entries.keys().next_back().copied(),
            })
            .unwrap_or_default())
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, LogError> {
        self.check_available()?;
        let state = self.lock();
        Ok(state
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .take(count)
                    .map(|(id, fields)| StreamEntry::new(*id, stream, fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn trim_before(&self, stream: &str, min_id: EntryId) -> Result<u64, LogError> {
        self.check_available()?;
        let mut state = self.lock();
        let Some(stream_state) = state.get_mut(stream) else {
            return Ok(0);
        };

        let kept = stream_state.entries.split_off(&min_id);
        let removed = stream_state.entries.len() as u64;
        stream_state.entries = kept;
        Ok(removed)
    }
}

#[async_trait]
impl LogConnector for InMemoryStreamLog {
    async fn connect(&self) -> Result<Arc<dyn StreamLog>, LogError> {
        self.check_available()?;
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STREAM: &str = "events:system";
    const GROUP: &str = "system-processors";

    fn fields(n: u32) -> StreamFields {
        StreamFields::new()
            .with("eventType", "system.health_check")
            .with("n", n.to_string())
    }

    fn streams() -> Vec<String> {
        vec![STREAM.to_string()]
    }

    #[tokio::test]
    async fn group_creation_is_idempotent_and_creates_stream() {
        let log = InMemoryStreamLog::new();

        assert_eq!(log.ensure_group(STREAM, GROUP).await.unwrap(), GroupCreation::Created);
        assert_eq!(log.ensure_group(STREAM, GROUP).await.unwrap(), GroupCreation::AlreadyExists);

        let groups = log.group_info(STREAM).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].last_delivered_id, EntryId::MIN);
    }

    #[tokio::test]
    async fn ids_increase_and_max_len_evicts_oldest() {
        let log = InMemoryStreamLog::new();
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(log.append(STREAM, &fields(n), Some(3)).await.unwrap());
        }

        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        let info = log.stream_info(STREAM).await.unwrap();
        assert_eq!(info.length, 3);
        assert_eq!(info.first_entry_id, Some(ids[2]));
        assert_eq!(info.last_entry_id, Some(ids[4]));
    }

    #[tokio::test]
    async fn group_created_after_appends_sees_history() {
        let log = InMemoryStreamLog::new();
        log.append(STREAM, &fields(1), None).await.unwrap();
        log.ensure_group(STREAM, GROUP).await.unwrap();

        let batch = log
            .read_group(GROUP, "c-1", &streams(), ReadFrom::New, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn new_entries_are_delivered_once_and_stay_pending_until_acked() {
        let log = InMemoryStreamLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();
        let id = log.append(STREAM, &fields(1), None).await.unwrap();

        let first = log
            .read_group(GROUP, "c-1", &streams(), ReadFrom::New, 10, Duration::ZERO)
            .await
            .unwrap();
        let second = log
            .read_group(GROUP, "c-2", &streams(), ReadFrom::New, 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(log.pending(STREAM, GROUP), vec![(id, "c-1".to_string(), 1)]);

        assert_eq!(log.ack(STREAM, GROUP, &[id]).await.unwrap(), 1);
        assert_eq!(log.ack(STREAM, GROUP, &[id]).await.unwrap(), 0);
        assert!(log.pending(STREAM, GROUP).is_empty());
    }

    #[tokio::test]
    async fn pending_history_is_redelivered_to_its_owner_only() {
        let log = InMemoryStreamLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();
        log.append(STREAM, &fields(1), None).await.unwrap();
        log.read_group(GROUP, "c-1", &streams(), ReadFrom::New, 10, Duration::ZERO)
            .await
            .unwrap();

        let other = log
            .read_group(GROUP, "c-2", &streams(), ReadFrom::Pending, 10, Duration::ZERO)
            .await
            .unwrap();
        let own = log
            .read_group(GROUP, "c-1", &streams(), ReadFrom::Pending, 10, Duration::ZERO)
            .await
            .unwrap();

        assert!(other.is_empty());
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].fields.get("n"), Some("1"));
        assert_eq!(log.pending(STREAM, GROUP)[0].2, 2);
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let log = InMemoryStreamLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();

        let reader = log.clone();
        let handle = tokio::spawn(async move {
            reader
                .read_group(GROUP, "c-1", &streams(), ReadFrom::New, 10, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append(STREAM, &fields(7), None).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let log = InMemoryStreamLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();

        let batch = log
            .read_group(GROUP, "c-1", &streams(), ReadFrom::New, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn reading_without_group_fails() {
        let log = InMemoryStreamLog::new();
        let err = log
            .read_group(GROUP, "c-1", &streams(), ReadFrom::New, 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Command(msg) if msg.starts_with("NOGROUP")));
    }

    #[tokio::test]
    async fn trim_removes_only_older_entries() {
        let log = InMemoryStreamLog::new();
        let first = log.append(STREAM, &fields(1), None).await.unwrap();
        let second = log.append(STREAM, &fields(2), None).await.unwrap();

        assert_eq!(log.trim_before(STREAM, second).await.unwrap(), 1);
        let remaining = log.range(STREAM, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second);
        assert_ne!(remaining[0].id, first);

        assert_eq!(log.trim_before("events:missing", second).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_log_fails_every_call() {
        let log = InMemoryStreamLog::new();
        log.set_available(false);

        assert!(matches!(log.ping().await, Err(LogError::Unavailable(_))));
        assert!(matches!(
            log.append(STREAM, &fields(1), None).await,
            Err(LogError::Unavailable(_))
        ));
        assert!(log.connect().await.is_err());

        log.set_available(true);
        assert!(log.append(STREAM, &fields(1), None).await.is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn capped_stream_keeps_newest_entries_in_order(appends in 1usize..40, cap in 1u64..20) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            rt.block_on(async {
                let log = InMemoryStreamLog::new();
                let mut ids = Vec::new();
                for n in 0..appends {
                    ids.push(log.append(STREAM, &fields(n as u32), Some(cap)).await.unwrap());
                }

                let kept = log.range(STREAM, usize::MAX).await.unwrap();
                let expected = appends.min(cap as usize);
                prop_assert_eq!(kept.len(), expected);
                prop_assert!(kept.windows(2).all(|w| w[0].id < w[1].id));
                prop_assert_eq!(kept.last().map(|e| e.id), ids.last().copied());
                Ok(())
            })?;
        }
    }

    #[tokio::test]
    async fn stale_entries_move_to_the_claiming_consumer() {
        let log = InMemoryStreamLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();
        log.append(STREAM, &fields(1), None).await.unwrap();
        let survivor = log.append(STREAM, &fields(2), None).await.unwrap();
        log.read_group(GROUP, "gone", &streams(), ReadFrom::New, 10, Duration::ZERO)
            .await
            .unwrap();

        let early = log
            .claim_stale(STREAM, GROUP, "alive", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        // Trimmed while pending: leaves the pending set without being handed out.
        log.trim_before(STREAM, survivor).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let claimed = log
            .claim_stale(STREAM, GROUP, "alive", Duration::from_millis(1), 10)
            .await
            .unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, survivor);
        assert_eq!(log.pending(STREAM, GROUP), vec![(survivor, "alive".to_string(), 2)]);
    }
}
