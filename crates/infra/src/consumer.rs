//! Consumer-group service: one loop per configured consumer identity.
//!
//! Every delivered entry ends in exactly one of these ways before it is
//! acknowledged:
//!
//! - **dropped**: the envelope has no `eventType` (structural failure),
//! - **dead-lettered**: schema rejection, or the handler kept failing,
//! - **unhandled**: no handler is registered for the type,
//! - **handled**: the handler succeeded (possibly after retries).
//!
//! If the entry's fate cannot be recorded (the dead-letter append or the ack
//! fails) it stays pending, the loop backs off, and the consumer re-drains its
//! own pending entries before reading new ones. Entries left pending by a
//! consumer that never came back are claimed once they sit idle for
//! `pendingClaimMs`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use streambus_core::FailureKind;
use streambus_events::{
    with_retry, DeadLetterEntry, EventHandler, EventRecord, HandlerRegistry, InboundEvent,
    SchemaValidator, StreamEntry,
};

use crate::config::{BusConfig, ConfigError, ConsumerConfig, StreamConfig};
use crate::stream_log::{GroupCreation, GroupInfo, LogConnector, LogError, ReadFrom, StreamLog};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to create group `{group}` on `{stream}`: {source}")]
    GroupInit {
        stream: String,
        group: String,
        #[source]
        source: LogError,
    },

    #[error("consumer service already running")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Log(#[from] LogError),
}

/// How a delivered entry was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled { attempts: u32 },
    Unhandled,
    Dropped,
    DeadLettered { kind: FailureKind, retry_count: u32 },
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    processed: AtomicU64,
    acknowledged: AtomicU64,
    handler_retries: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    unhandled: AtomicU64,
    loop_errors: AtomicU64,
}

impl ConsumerCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            processed: self.processed.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            handler_retries: self.handler_retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            loop_errors: self.loop_errors.load(Ordering::Relaxed),
        }
    }
}

/// Cumulative counters since the service was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStats {
    pub processed: u64,
    pub acknowledged: u64,
    pub handler_retries: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub unhandled: u64,
    pub loop_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerHealth {
    pub is_running: bool,
    pub consumers: Vec<String>,
    pub handlers: Vec<String>,
    pub stats: ConsumerStats,
}

/// Per-entry pipeline shared by every loop of one service.
struct Dispatcher {
    validator: Arc<dyn SchemaValidator>,
    handlers: HandlerRegistry,
    dead_letter: StreamConfig,
    counters: ConsumerCounters,
}

impl Dispatcher {
    async fn process_entry(
        &self,
        log: &dyn StreamLog,
        consumer: &ConsumerConfig,
        entry: StreamEntry,
    ) -> Result<Disposition, LogError> {
        ConsumerCounters::bump(&self.counters.processed);

        let record = match EventRecord::unpack(&entry.fields) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    entry_id = %entry.id,
                    stream = %entry.stream,
                    error = %e,
                    "dropping malformed entry"
                );
                self.ack(log, consumer, &entry).await?;
                ConsumerCounters::bump(&self.counters.dropped);
                return Ok(Disposition::Dropped);
            }
        };

        let event = InboundEvent {
            entry_id: entry.id,
            stream: entry.stream.clone(),
            event_type: record.event_type.clone(),
            event_id: record.event_id.clone(),
            data: record.event_data.clone(),
        };
        let event_id = event.correlation_id();

        if let Err(errors) = self.validator.validate_event(&record.event_type, &record.event_data) {
            let dead = DeadLetterEntry::validation_failure(
                &record,
                event_id.as_str(),
                entry.stream.as_str(),
                errors.messages(),
            );
            warn!(
                event_id = %event_id,
                event_type = %record.event_type,
                stream = %entry.stream,
                errors = %errors,
                "event failed validation"
            );
            self.quarantine(log, consumer, &entry, &dead).await?;
            return Ok(Disposition::DeadLettered {
                kind: FailureKind::Validation,
                retry_count: 0,
            });
        }

        let Some(handler) = self.handlers.get(&record.event_type) else {
            info!(
                event_id = %event_id,
                event_type = %record.event_type,
                stream = %entry.stream,
                "no handler registered; acknowledging"
            );
            self.ack(log, consumer, &entry).await?;
            ConsumerCounters::bump(&self.counters.unhandled);
            return Ok(Disposition::Unhandled);
        };

        let policy = consumer.retry_policy();
        let outcome = with_retry(&policy, |attempt| {
            invoke(handler.clone(), &event, attempt, policy.max_attempts())
        })
        .await;

        match outcome {
            Ok(done) => {
                self.counters
                    .handler_retries
                    .fetch_add(u64::from(done.attempts - 1), Ordering::Relaxed);
                self.ack(log, consumer, &entry).await?;
                debug!(
                    event_id = %event_id,
                    event_type = %record.event_type,
                    stream = %entry.stream,
                    attempts = done.attempts,
                    "event handled"
                );
                Ok(Disposition::Handled {
                    attempts: done.attempts,
                })
            }
            Err(exhausted) => {
                self.counters
                    .handler_retries
                    .fetch_add(u64::from(exhausted.attempts - 1), Ordering::Relaxed);
                let dead = DeadLetterEntry::handler_failure(
                    &record,
                    event_id.as_str(),
                    entry.stream.as_str(),
                    format!("{:#}", exhausted.last_error),
                    exhausted.attempts,
                );
                error!(
                    event_id = %event_id,
                    event_type = %record.event_type,
                    stream = %entry.stream,
                    attempts = exhausted.attempts,
                    error = %dead.error,
                    "handler retries exhausted"
                );
                self.quarantine(log, consumer, &entry, &dead).await?;
                Ok(Disposition::DeadLettered {
                    kind: FailureKind::Handler,
                    retry_count: exhausted.attempts,
                })
            }
        }
    }

    /// Append to the dead-letter stream, then acknowledge the original.
    async fn quarantine(
        &self,
        log: &dyn StreamLog,
        consumer: &ConsumerConfig,
        entry: &StreamEntry,
        dead: &DeadLetterEntry,
    ) -> Result<(), LogError> {
        log.append(
            &self.dead_letter.stream_name,
            &dead.pack(),
            Some(self.dead_letter.max_length),
        )
        .await?;
        self.ack(log, consumer, entry).await?;
        ConsumerCounters::bump(&self.counters.dead_lettered);
        Ok(())
    }

    async fn ack(
        &self,
        log: &dyn StreamLog,
        consumer: &ConsumerConfig,
        entry: &StreamEntry,
    ) -> Result<(), LogError> {
        log.ack(&entry.stream, &consumer.group_name, &[entry.id]).await?;
        ConsumerCounters::bump(&self.counters.acknowledged);
        Ok(())
    }
}

async fn invoke(
    handler: Arc<dyn EventHandler>,
    event: &InboundEvent,
    attempt: u32,
    max_attempts: u32,
) -> anyhow::Result<()> {
    let result = handler.handle(event).await;
    if let Err(e) = &result {
        warn!(
            event_id = %event.correlation_id(),
            event_type = %event.event_type,
            stream = %event.stream,
            attempt,
            max_attempts,
            error = %e,
            "handler attempt failed"
        );
    }
    result
}

/// Reads the configured streams under their consumer groups and dispatches
/// entries to registered handlers.
pub struct EventConsumerService {
    connector: Arc<dyn LogConnector>,
    config: Arc<BusConfig>,
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    admin: OnceCell<Arc<dyn StreamLog>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventConsumerService {
    pub fn new(
        connector: Arc<dyn LogConnector>,
        validator: Arc<dyn SchemaValidator>,
        config: BusConfig,
    ) -> Self {
        let dispatcher = Dispatcher {
            validator,
            handlers: HandlerRegistry::new(),
            dead_letter: config.streams.dead_letter.clone(),
            counters: ConsumerCounters::default(),
        };

        Self {
            connector,
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            running: Arc::new(AtomicBool::new(false)),
            admin: OnceCell::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register the handler for `event_type`, replacing any previous one.
    pub fn register_handler<H>(&self, event_type: impl Into<String>, handler: H)
    where
        H: EventHandler + 'static,
    {
        let event_type = event_type.into();
        if self.dispatcher.handlers.register(event_type.clone(), Arc::new(handler)) {
            warn!(event_type = %event_type, "handler replaced");
        } else {
            info!(event_type = %event_type, "handler registered");
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.dispatcher.handlers
    }

    /// Connection for group management and stats (not used by the loops).
    async fn admin(&self) -> Result<&Arc<dyn StreamLog>, LogError> {
        self.admin.get_or_try_init(|| self.connector.connect()).await
    }

    /// (stream, group) pairs to create: every live stream's own group plus
    /// every consumer's group on each stream it reads.
    fn group_targets(&self) -> BTreeSet<(String, String)> {
        let mut targets = BTreeSet::new();
        for stream in self.config.streams.live() {
            targets.insert((stream.stream_name.clone(), stream.consumer_group.clone()));
        }
        for consumer in self.config.consumers.values() {
            for stream in &consumer.streams {
                targets.insert((stream.clone(), consumer.group_name.clone()));
            }
        }
        targets
    }

    /// Create every consumer group that does not exist yet.
    pub async fn initialize(&self) -> Result<(), ConsumerError> {
        let log = self.admin().await?;

        for (stream, group) in self.group_targets() {
            match log.ensure_group(&stream, &group).await {
                Ok(GroupCreation::Created) => info!(stream = %stream, group = %group, "consumer group created"),
                Ok(GroupCreation::AlreadyExists) => debug!(stream = %stream, group = %group, "consumer group exists"),
                Err(source) => return Err(ConsumerError::GroupInit { stream, group, source }),
            }
        }
        Ok(())
    }

    /// Initialize groups and spawn one loop per configured consumer.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyRunning);
        }

        if let Err(e) = self.spawn_loops().await {
            self.running.store(false, Ordering::SeqCst);
            self.join_loops().await;
            return Err(e);
        }
        Ok(())
    }

    async fn spawn_loops(&self) -> Result<(), ConsumerError> {
        self.config.validate()?;
        self.initialize().await?;

        for consumer in self.config.consumers.values() {
            let log = self.connector.connect().await?;
            let handle = tokio::spawn(run_consumer(
                self.dispatcher.clone(),
                log,
                consumer.clone(),
                self.running.clone(),
                self.config.error_backoff(),
            ));
            self.tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
        }

        info!(
            consumers = self.config.consumers.len(),
            handlers = self.dispatcher.handlers.len(),
            "consumer service started"
        );
        Ok(())
    }

    /// Stop every loop and wait for in-flight entries to finish.
    ///
    /// Returns after at most one block timeout plus the entry in progress.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.join_loops().await;
        info!("consumer service stopped");
    }

    async fn join_loops(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "consumer task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Group metadata per live stream.
    pub async fn consumer_stats(&self) -> Result<BTreeMap<String, Vec<GroupInfo>>, ConsumerError> {
        let log = self.admin().await?;
        let mut stats = BTreeMap::new();
        for stream in self.config.streams.live() {
            let groups = log.group_info(&stream.stream_name).await?;
            stats.insert(stream.stream_name.clone(), groups);
        }
        Ok(stats)
    }

    pub fn stats(&self) -> ConsumerStats {
        self.dispatcher.counters.snapshot()
    }

    pub fn health_status(&self) -> ConsumerHealth {
        ConsumerHealth {
            is_running: self.is_running(),
            consumers: self
                .config
                .consumers
                .values()
                .map(|c| format!("{}/{}", c.group_name, c.consumer_name))
                .collect(),
            handlers: self.dispatcher.handlers.event_types(),
            stats: self.stats(),
        }
    }

    /// Run one entry through the pipeline under `consumer`'s identity.
    pub(crate) async fn process_entry(
        &self,
        log: &dyn StreamLog,
        consumer: &ConsumerConfig,
        entry: StreamEntry,
    ) -> Result<Disposition, LogError> {
        self.dispatcher.process_entry(log, consumer, entry).await
    }
}

async fn run_consumer(
    dispatcher: Arc<Dispatcher>,
    log: Arc<dyn StreamLog>,
    consumer: ConsumerConfig,
    running: Arc<AtomicBool>,
    error_backoff: Duration,
) {
    info!(
        group = %consumer.group_name,
        consumer = %consumer.consumer_name,
        streams = ?consumer.streams,
        "consumer loop started"
    );

    // Entries delivered before a crash come back first.
    let mut from = ReadFrom::Pending;
    let mut last_claim: Option<Instant> = None;

    while running.load(Ordering::SeqCst) {
        let claim_due = match (consumer.claim_idle(), last_claim) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(idle), Some(at)) => at.elapsed() >= idle,
        };

        let polled = if from == ReadFrom::New && claim_due {
            last_claim = Some(Instant::now());
            claim_once(&dispatcher, log.as_ref(), &consumer).await
        } else {
            poll_once(&dispatcher, log.as_ref(), &consumer, from).await
        };

        match polled {
            Ok(0) if from == ReadFrom::Pending => from = ReadFrom::New,
            // An empty non-blocking read completes without suspending.
            Ok(0) => tokio::task::yield_now().await,
            Ok(_) => {}
            Err(e) => {
                ConsumerCounters::bump(&dispatcher.counters.loop_errors);
                error!(
                    group = %consumer.group_name,
                    consumer = %consumer.consumer_name,
                    error = %e,
                    "consumer loop error; backing off"
                );
                from = ReadFrom::Pending;
                tokio::time::sleep(error_backoff).await;
                tokio::task::yield_now().await;
            }
        }
    }

    info!(
        group = %consumer.group_name,
        consumer = %consumer.consumer_name,
        "consumer loop stopped"
    );
}

/// Take over entries other consumers of the group left idle, and process them.
async fn claim_once(
    dispatcher: &Dispatcher,
    log: &dyn StreamLog,
    consumer: &ConsumerConfig,
) -> Result<usize, LogError> {
    let Some(min_idle) = consumer.claim_idle() else {
        return Ok(0);
    };

    let mut count = 0;
    for stream in &consumer.streams {
        let claimed = log
            .claim_stale(
                stream,
                &consumer.group_name,
                &consumer.consumer_name,
                min_idle,
                consumer.batch_size,
            )
            .await?;
        if !claimed.is_empty() {
            warn!(
                stream = %stream,
                group = %consumer.group_name,
                consumer = %consumer.consumer_name,
                claimed = claimed.len(),
                "claimed idle pending entries"
            );
        }
        count += claimed.len();
        for entry in claimed {
            dispatcher.process_entry(log, consumer, entry).await?;
        }
    }
    Ok(count)
}

async fn poll_once(
    dispatcher: &Dispatcher,
    log: &dyn StreamLog,
    consumer: &ConsumerConfig,
    from: ReadFrom,
) -> Result<usize, LogError> {
    let batch = log
        .read_group(
            &consumer.group_name,
            &consumer.consumer_name,
            &consumer.streams,
            from,
            consumer.batch_size,
            consumer.block_time(),
        )
        .await?;

    let count = batch.len();
    for entry in batch {
        dispatcher.process_entry(log, consumer, entry).await?;
    }
    Ok(count)
}
