//! Dead-letter stream management.
//!
//! Reprocessing reads the dead-letter group with the "new entries" cursor, so
//! every quarantined entry is offered once. Successfully resubmitted entries
//! are acknowledged; the ones that fail stay pending in the group for manual
//! intervention and are not offered again. A failure on one entry, including
//! a failed acknowledgement, never stops the rest of the batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use streambus_core::{EntryId, FailureKind};
use streambus_events::{with_retry, DeadLetterEntry};

use crate::config::BusConfig;
use crate::stream_log::{GroupCreation, LogError, ReadFrom, StreamLog};

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter service is stopped")]
    Stopped,

    #[error(transparent)]
    Log(#[from] LogError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStats {
    pub stream_name: String,
    pub total_entries: u64,
    /// Entries handed to reprocessing that were not resubmitted.
    pub pending: u64,
    pub consumers: u64,
    pub oldest_entry_id: Option<EntryId>,
    pub newest_entry_id: Option<EntryId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessReport {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterHealth {
    pub is_connected: bool,
    pub stream_name: String,
    pub total_entries: Option<u64>,
    pub stopped: bool,
}

/// Owns the dead-letter stream.
pub struct DeadLetterService {
    log: Arc<dyn StreamLog>,
    config: Arc<BusConfig>,
    initialized: AtomicBool,
    stopped: AtomicBool,
}

impl DeadLetterService {
    pub fn new(log: Arc<dyn StreamLog>, config: BusConfig) -> Self {
        Self {
            log,
            config: Arc::new(config),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    fn stream_name(&self) -> &str {
        &self.config.streams.dead_letter.stream_name
    }

    fn group_name(&self) -> &str {
        &self.config.streams.dead_letter.consumer_group
    }

    fn ensure_running(&self) -> Result<(), DeadLetterError> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(DeadLetterError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Create the dead-letter group unless it exists.
    pub async fn initialize(&self) -> Result<GroupCreation, DeadLetterError> {
        self.ensure_running()?;
        let created = self.log.ensure_group(self.stream_name(), self.group_name()).await?;
        self.initialized.store(true, Ordering::SeqCst);

        if created == GroupCreation::Created {
            info!(stream = self.stream_name(), group = self.group_name(), "dead-letter group created");
        }
        Ok(created)
    }

    pub async fn dead_letter_stats(&self) -> Result<DeadLetterStats, DeadLetterError> {
        self.ensure_running()?;
        let info = self.log.stream_info(self.stream_name()).await?;

        let group = if info.length > 0 || self.initialized.load(Ordering::SeqCst) {
            self.log
                .group_info(self.stream_name())
                .await?
                .into_iter()
                .find(|g| g.name == self.group_name())
        } else {
            None
        };

        Ok(DeadLetterStats {
            stream_name: self.stream_name().to_string(),
            total_entries: info.length,
            pending: group.as_ref().map_or(0, |g| g.pending),
            consumers: group.as_ref().map_or(0, |g| g.consumers),
            oldest_entry_id: info.first_entry_id,
            newest_entry_id: info.last_entry_id,
        })
    }

    /// Up to `limit` quarantined entries, oldest first. Undecodable entries
    /// are skipped.
    pub async fn list_entries(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.ensure_running()?;
        let raw = self.log.range(self.stream_name(), limit).await?;

        Ok(raw
            .into_iter()
            .filter_map(|entry| match DeadLetterEntry::unpack(&entry.fields) {
                Ok(dead) => Some(dead),
                Err(e) => {
                    warn!(entry_id = %entry.id, stream = self.stream_name(), error = %e, "undecodable dead-letter entry");
                    None
                }
            })
            .collect())
    }

    /// Resubmit up to `limit` not-yet-reprocessed entries to their original
    /// streams.
    pub async fn reprocess_events(&self, limit: usize) -> Result<ReprocessReport, DeadLetterError> {
        self.ensure_running()?;
        if limit == 0 {
            return Ok(ReprocessReport::default());
        }
        if !self.initialized.load(Ordering::SeqCst) {
            self.initialize().await?;
        }

        let batch = self
            .log
            .read_group(
                self.group_name(),
                &self.config.dead_letter.consumer_name,
                &[self.stream_name().to_string()],
                ReadFrom::New,
                limit,
                Duration::ZERO,
            )
            .await?;

        let policy = self.config.dead_letter.retry_policy();
        let mut report = ReprocessReport::default();

        for entry in batch {
            let dead = match DeadLetterEntry::unpack(&entry.fields) {
                Ok(dead) => dead,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        entry_id = %entry.id,
                        stream = self.stream_name(),
                        kind = %FailureKind::Reprocess,
                        error = %e,
                        "dead-letter entry cannot be decoded; left quarantined"
                    );
                    continue;
                }
            };

            let Some(origin) = self.config.streams.find(&dead.original_stream) else {
                report.failed += 1;
                warn!(
                    event_id = %dead.original_event_id,
                    event_type = %dead.event_type,
                    stream = %dead.original_stream,
                    kind = %FailureKind::Reprocess,
                    "unknown original stream; left quarantined"
                );
                continue;
            };

            let fields = dead.to_record().pack();
            let resubmitted = with_retry(&policy, |_| {
                self.log.append(&origin.stream_name, &fields, Some(origin.max_length))
            })
            .await;

            match resubmitted {
                Ok(done) => {
                    if let Err(e) = self.log.ack(self.stream_name(), self.group_name(), &[entry.id]).await {
                        report.failed += 1;
                        error!(
                            event_id = %dead.original_event_id,
                            event_type = %dead.event_type,
                            stream = %origin.stream_name,
                            entry_id = %done.value,
                            dead_letter_id = %dead.id,
                            kind = %FailureKind::Reprocess,
                            error = %e,
                            "resubmitted but not acknowledged; left quarantined"
                        );
                        continue;
                    }
                    report.processed += 1;
                    info!(
                        event_id = %dead.original_event_id,
                        event_type = %dead.event_type,
                        stream = %origin.stream_name,
                        entry_id = %done.value,
                        dead_letter_id = %dead.id,
                        "dead-letter entry resubmitted"
                    );
                }
                Err(exhausted) => {
                    report.failed += 1;
                    error!(
                        event_id = %dead.original_event_id,
                        event_type = %dead.event_type,
                        stream = %origin.stream_name,
                        dead_letter_id = %dead.id,
                        kind = %FailureKind::Reprocess,
                        attempts = exhausted.attempts,
                        error = %exhausted.last_error,
                        "resubmission failed; left quarantined"
                    );
                }
            }
        }

        if report != ReprocessReport::default() {
            info!(processed = report.processed, failed = report.failed, "dead-letter reprocessing finished");
        }
        Ok(report)
    }

    /// Trim entries older than `max_age_days`; returns how many were removed.
    pub async fn clear_old_entries(&self, max_age_days: u32) -> Result<u64, DeadLetterError> {
        self.ensure_running()?;
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let removed = self
            .log
            .trim_before(self.stream_name(), EntryId::from_datetime(cutoff))
            .await?;

        if removed > 0 {
            info!(stream = self.stream_name(), removed, max_age_days, "old dead-letter entries trimmed");
        }
        Ok(removed)
    }

    pub async fn health_status(&self) -> DeadLetterHealth {
        let stopped = self.stopped.load(Ordering::SeqCst);
        let (is_connected, total_entries) = if stopped {
            (false, None)
        } else {
            match self.log.stream_info(self.stream_name()).await {
                Ok(info) => (true, Some(info.length)),
                Err(_) => (false, None),
            }
        };

        DeadLetterHealth {
            is_connected,
            stream_name: self.stream_name().to_string(),
            total_entries,
            stopped,
        }
    }

    /// Later calls fail with [`DeadLetterError::Stopped`].
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(stream = self.stream_name(), "dead-letter service stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_log::{GroupInfo, InMemoryStreamLog, StreamInfo};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use streambus_events::{EventRecord, StreamEntry, StreamFields};

    const DLQ: &str = "events:dead-letter";

    fn service(log: &InMemoryStreamLog) -> DeadLetterService {
        DeadLetterService::new(Arc::new(log.clone()), BusConfig::for_tests())
    }

    async fn quarantine(log: &InMemoryStreamLog, original_stream: &str) -> DeadLetterEntry {
        let record = EventRecord::bare("attempt.failed", json!({"attemptId": "a-1", "workItemId": "wi-1"}));
        let dead = DeadLetterEntry::handler_failure(&record, "evt-1", original_stream, "boom", 4);
        log.append(DLQ, &dead.pack(), None).await.unwrap();
        dead
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let log = InMemoryStreamLog::new();
        let service = service(&log);
        assert_eq!(service.initialize().await.unwrap(), GroupCreation::Created);
        assert_eq!(service.initialize().await.unwrap(), GroupCreation::AlreadyExists);
    }

    #[tokio::test]
    async fn stats_and_listing_reflect_stream() {
        let log = InMemoryStreamLog::new();
        let service = service(&log);
        service.initialize().await.unwrap();
        let dead = quarantine(&log, "events:attempts").await;
        log.append(DLQ, &StreamFields::new().with("junk", "1"), None).await.unwrap();

        let stats = service.dead_letter_stats().await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.pending, 0);
        assert!(stats.oldest_entry_id < stats.newest_entry_id);

        let listed = service.list_entries(10).await.unwrap();
        assert_eq!(listed, vec![dead]);
    }

    #[tokio::test]
    async fn reprocess_resubmits_to_origin_and_acknowledges() {
        let log = InMemoryStreamLog::new();
        let service = service(&log);
        quarantine(&log, "events:attempts").await;

        let report = service.reprocess_events(10).await.unwrap();
        assert_eq!(report, ReprocessReport { processed: 1, failed: 0 });

        let resubmitted = log.range("events:attempts", 10).await.unwrap();
        assert_eq!(resubmitted.len(), 1);
        assert_eq!(resubmitted[0].fields.get("eventId"), Some("evt-1"));
        assert_eq!(resubmitted[0].fields.get("eventType"), Some("attempt.failed"));

        assert_eq!(service.dead_letter_stats().await.unwrap().pending, 0);
        assert_eq!(service.reprocess_events(10).await.unwrap(), ReprocessReport::default());
    }

    #[tokio::test]
    async fn failures_stay_quarantined_and_are_not_offered_again() {
        let log = InMemoryStreamLog::new();
        let service = service(&log);
        quarantine(&log, "events:nowhere").await;
        log.append(DLQ, &StreamFields::new().with("junk", "1"), None).await.unwrap();

        let report = service.reprocess_events(10).await.unwrap();
        assert_eq!(report, ReprocessReport { processed: 0, failed: 2 });
        assert_eq!(service.dead_letter_stats().await.unwrap().pending, 2);

        assert_eq!(service.reprocess_events(10).await.unwrap(), ReprocessReport::default());
    }

    #[tokio::test]
    async fn reprocess_respects_limit() {
        let log = InMemoryStreamLog::new();
        let service = service(&log);
        for _ in 0..3 {
            quarantine(&log, "events:attempts").await;
        }

        assert_eq!(service.reprocess_events(2).await.unwrap().processed, 2);
        assert_eq!(service.reprocess_events(2).await.unwrap().processed, 1);
        assert_eq!(service.reprocess_events(0).await.unwrap(), ReprocessReport::default());
    }

    #[tokio::test]
    async fn clear_old_entries_trims_by_age() {
        let log = InMemoryStreamLog::new();
        let service = service(&log);

        assert_eq!(service.clear_old_entries(0).await.unwrap(), 0);

        quarantine(&log, "events:attempts").await;
        assert_eq!(service.clear_old_entries(30).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(service.clear_old_entries(0).await.unwrap() >= 1);
        assert_eq!(log.stream_info(DLQ).await.unwrap().length, 0);
    }

    #[tokio::test]
    async fn stopped_service_rejects_calls() {
        let log = InMemoryStreamLog::new();
        let service = service(&log);
        service.stop();

        assert!(matches!(service.reprocess_events(1).await, Err(DeadLetterError::Stopped)));
        let health = service.health_status().await;
        assert!(health.stopped);
        assert!(!health.is_connected);
    }

    /// In-memory log whose first `failing_acks` acknowledgements are refused.
    struct FlakyAck {
        inner: InMemoryStreamLog,
        failing_acks: AtomicU32,
    }

    #[async_trait]
    impl StreamLog for FlakyAck {
        async fn ping(&self) -> Result<(), LogError> {
            self.inner.ping().await
        }

        async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupCreation, LogError> {
            self.inner.ensure_group(stream, group).await
        }

        async fn append(&self, stream: &str, fields: &StreamFields, max_len: Option<u64>) -> Result<EntryId, LogError> {
            self.inner.append(stream, fields, max_len).await
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
            self.inner.read_group(group, consumer, streams, from, count, block).await
        }

        async fn claim_stale(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle: Duration,
            count: usize,
        ) -> Result<Vec<StreamEntry>, LogError> {
            self.inner.claim_stale(stream, group, consumer, min_idle, count).await
        }

        async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, LogError> {
            let refuse = self
                .failing_acks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refuse {
                return Err(LogError::Unavailable("connection reset".to_string()));
            }
            self.inner.ack(stream, group, ids).await
        }

        async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>, LogError> {
            self.inner.group_info(stream).await
        }

        async fn stream_info(&self, stream: &str) -> Result<StreamInfo, LogError> {
            self.inner.stream_info(stream).await
        }

        async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, LogError> {
            self.inner.range(stream, count).await
        }

        async fn trim_before(&self, stream: &str, min_id: EntryId) -> Result<u64, LogError> {
            self.inner.trim_before(stream, min_id).await
        }
    }

    #[tokio::test]
    async fn failed_ack_does_not_abandon_the_rest_of_the_batch() {
        let log = InMemoryStreamLog::new();
        let flaky = FlakyAck {
            inner: log.clone(),
            failing_acks: AtomicU32::new(1),
        };
        let service = DeadLetterService::new(Arc::new(flaky), BusConfig::for_tests());
        for _ in 0..3 {
            quarantine(&log, "events:attempts").await;
        }

        let report = service.reprocess_events(10).await.unwrap();
        assert_eq!(report, ReprocessReport { processed: 2, failed: 1 });
        assert_eq!(log.range("events:attempts", 10).await.unwrap().len(), 3);
        assert_eq!(service.dead_letter_stats().await.unwrap().pending, 1);
    }
}
