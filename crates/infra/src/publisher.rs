//! Event publisher with a local outbox.
//!
//! `publish_event` validates, then appends synchronously. When the log is
//! unreachable the event is buffered in the outbox instead of failing the
//! caller; `flush_outbox` (explicitly or from the flush timer) retries the
//! buffered events and marks the ones that keep failing as permanently failed.
//!
//! Permanently failed outbox entries are a producer-side failure store. They
//! never reach the dead-letter stream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use streambus_core::{EntryId, EventId, OutboxId};
use streambus_events::{Event, EventRecord, SchemaValidator, ValidationErrors};

use crate::config::{PublisherConfig, StreamConfig};
use crate::stream_log::StreamLog;

#[derive(Debug, Error)]
pub enum PublishError {
    /// Rejected by the schema; nothing was appended or buffered.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("publisher is stopped")]
    Stopped,
}

/// Where an accepted event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PublishReceipt {
    /// Appended to the stream under the given log id.
    #[serde(rename_all = "camelCase")]
    Appended { event_id: EventId, entry_id: EntryId },
    /// The log was unreachable; the event waits in the outbox.
    #[serde(rename_all = "camelCase")]
    Buffered { event_id: EventId, outbox_id: OutboxId },
}

impl PublishReceipt {
    pub fn event_id(&self) -> EventId {
        match *self {
            PublishReceipt::Appended { event_id, .. } | PublishReceipt::Buffered { event_id, .. } => {
                event_id
            }
        }
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self, PublishReceipt::Buffered { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    PermanentlyFailed,
}

/// An event waiting for a successful append.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: OutboxId,
    pub event: Event,
    /// Flush attempts made so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
}

impl OutboxEntry {
    fn new(event: Event, error: String) -> Self {
        Self {
            id: OutboxId::new(),
            event,
            attempts: 0,
            last_error: Some(error),
            created_at: Utc::now(),
            status: OutboxStatus::Pending,
        }
    }
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Buffered events appended during this pass.
    pub published: usize,
    /// Buffered events that crossed the retry ceiling during this pass.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherHealth {
    pub is_connected: bool,
    /// Entries still waiting to be flushed.
    pub outbox_size: usize,
    pub permanently_failed: usize,
    pub stream_name: String,
    pub stopped: bool,
}

struct FlushTimer {
    shutdown_tx: watch::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    log: Mutex<Option<Arc<dyn StreamLog>>>,
    validator: Arc<dyn SchemaValidator>,
    stream: StreamConfig,
    config: PublisherConfig,
    outbox: Mutex<BTreeMap<OutboxId, OutboxEntry>>,
    flushing: AtomicBool,
    stopped: AtomicBool,
    timer: Mutex<Option<FlushTimer>>,
}

/// Publishes events to one stream.
///
/// Cheap to clone; clones share the connection and the outbox.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

/// Resets the flush-in-progress flag however the flush ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EventPublisher {
    pub fn new(
        log: Arc<dyn StreamLog>,
        validator: Arc<dyn SchemaValidator>,
        stream: StreamConfig,
        config: PublisherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                log: Mutex::new(Some(log)),
                validator,
                stream,
                config,
                outbox: Mutex::new(BTreeMap::new()),
                flushing: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.inner.stream.stream_name
    }

    fn log(&self) -> Option<Arc<dyn StreamLog>> {
        lock(&self.inner.log).clone()
    }

    /// Validate and append `event`, buffering it when the log is unreachable.
    pub async fn publish_event(&self, event: Event) -> Result<PublishReceipt, PublishError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(PublishError::Stopped);
        }

        self.inner
            .validator
            .validate_event(event.event_type(), event.data())
            .map_err(PublishError::Validation)?;

        let log = self.log().ok_or(PublishError::Stopped)?;
        let event_id = event.id();
        let stream = self.stream_name();

        match log
            .append(stream, &EventRecord::from_event(&event).pack(), Some(self.inner.stream.max_length))
            .await
        {
            Ok(entry_id) => {
                debug!(
                    event_id = %event_id,
                    event_type = event.event_type(),
                    stream,
                    entry_id = %entry_id,
                    "event published"
                );
                Ok(PublishReceipt::Appended { event_id, entry_id })
            }
            Err(e) => {
                let entry = OutboxEntry::new(event, e.to_string());
                let outbox_id = entry.id;
                warn!(
                    event_id = %event_id,
                    event_type = entry.event.event_type(),
                    stream,
                    outbox_id = %outbox_id,
                    error = %e,
                    "append failed; event buffered in outbox"
                );
                lock(&self.inner.outbox).insert(outbox_id, entry);
                Ok(PublishReceipt::Buffered { event_id, outbox_id })
            }
        }
    }

    /// Retry every pending outbox entry once, oldest first.
    ///
    /// Returns `{0, 0}` without touching the log when another flush is
    /// already running.
    pub async fn flush_outbox(&self) -> FlushReport {
        if self
            .inner
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(stream = self.stream_name(), "flush already in progress");
            return FlushReport::default();
        }
        let _guard = FlushGuard(&self.inner.flushing);

        let Some(log) = self.log() else {
            return FlushReport::default();
        };

        // Snapshot so the lock is not held across appends.
        let batch: Vec<(OutboxId, Event)> = lock(&self.inner.outbox)
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .map(|e| (e.id, e.event.clone()))
            .collect();

        let mut report = FlushReport::default();
        let stream = self.stream_name();

        for (outbox_id, event) in batch {
            let fields = EventRecord::from_outbox(&event, outbox_id).pack();
            match log.append(stream, &fields, Some(self.inner.stream.max_length)).await {
                Ok(entry_id) => {
                    lock(&self.inner.outbox).remove(&outbox_id);
                    report.published += 1;
                    info!(
                        event_id = %event.id(),
                        event_type = event.event_type(),
                        stream,
                        outbox_id = %outbox_id,
                        entry_id = %entry_id,
                        "outbox entry published"
                    );
                }
                Err(e) => {
                    let mut outbox = lock(&self.inner.outbox);
                    let Some(entry) = outbox.get_mut(&outbox_id) else {
                        continue;
                    };
                    entry.attempts += 1;
                    entry.last_error = Some(e.to_string());

                    if entry.attempts >= self.inner.config.outbox_max_retries {
                        entry.status = OutboxStatus::PermanentlyFailed;
                        report.failed += 1;
                        error!(
                            event_id = %event.id(),
                            event_type = event.event_type(),
                            stream,
                            outbox_id = %outbox_id,
                            attempts = entry.attempts,
                            error = %e,
                            "outbox entry permanently failed"
                        );
                    } else {
                        warn!(
                            event_id = %event.id(),
                            event_type = event.event_type(),
                            stream,
                            outbox_id = %outbox_id,
                            attempts = entry.attempts,
                            error = %e,
                            "outbox flush attempt failed"
                        );
                    }
                }
            }
        }

        if report != FlushReport::default() {
            info!(stream, published = report.published, failed = report.failed, "outbox flushed");
        }
        report
    }

    /// Entries still waiting to be flushed.
    pub fn outbox_len(&self) -> usize {
        lock(&self.inner.outbox)
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .count()
    }

    pub fn pending_entries(&self) -> Vec<OutboxEntry> {
        lock(&self.inner.outbox)
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn permanently_failed(&self) -> Vec<OutboxEntry> {
        lock(&self.inner.outbox)
            .values()
            .filter(|e| e.status == OutboxStatus::PermanentlyFailed)
            .cloned()
            .collect()
    }

    /// Remove and return the permanently failed entries (operator hand-off).
    pub fn take_permanently_failed(&self) -> Vec<OutboxEntry> {
        let mut outbox = lock(&self.inner.outbox);
        let ids: Vec<OutboxId> = outbox
            .values()
            .filter(|e| e.status == OutboxStatus::PermanentlyFailed)
            .map(|e| e.id)
            .collect();
        ids.iter().filter_map(|id| outbox.remove(id)).collect()
    }

    pub async fn health_status(&self) -> PublisherHealth {
        let is_connected = match self.log() {
            Some(log) => log.ping().await.is_ok(),
            None => false,
        };
        let (outbox_size, permanently_failed) = {
            let outbox = lock(&self.inner.outbox);
            let failed = outbox
                .values()
                .filter(|e| e.status == OutboxStatus::PermanentlyFailed)
                .count();
            (outbox.len() - failed, failed)
        };

        PublisherHealth {
            is_connected,
            outbox_size,
            permanently_failed,
            stream_name: self.inner.stream.stream_name.clone(),
            stopped: self.inner.stopped.load(Ordering::SeqCst),
        }
    }

    /// Flush the outbox every `flush_interval` until [`stop`](Self::stop).
    ///
    /// Calling it again while a timer runs is a no-op.
    pub fn start_flush_timer(&self) {
        let mut timer = lock(&self.inner.timer);
        if timer.is_some() || self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let publisher = self.clone();
        let period = self.inner.config.flush_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if publisher.outbox_len() > 0 {
                            publisher.flush_outbox().await;
                        }
                    }
                }
            }
            debug!(stream = publisher.stream_name(), "flush timer stopped");
        });

        *timer = Some(FlushTimer { shutdown_tx, handle });
    }

    /// Stop the timer, flush once more, then close the connection.
    ///
    /// Later publishes fail with [`PublishError::Stopped`].
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let timer = lock(&self.inner.timer).take();
        if let Some(timer) = timer {
            let _ = timer.shutdown_tx.send(());
            if let Err(e) = timer.handle.await {
                warn!(error = %e, "flush timer task ended abnormally");
            }
        }

        let report = self.flush_outbox().await;
        lock(&self.inner.log).take();

        info!(
            stream = self.stream_name(),
            published = report.published,
            remaining = self.outbox_len(),
            "publisher stopped"
        );
    }
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("stream", &self.inner.stream.stream_name)
            .field("outbox_len", &self.outbox_len())
            .finish()
    }
}
