//! Integration tests for the full bus pipeline.
//!
//! Tests: Publisher → StreamLog → ConsumerService → Handler / DeadLetter → Reprocess
//!
//! Verifies:
//! - Published events reach their handler and are acknowledged
//! - Schema rejections and exhausted handlers land in the dead-letter stream
//! - Dead-letter entries can be resubmitted and trimmed
//! - Broker outages are absorbed by the outbox and the consumer loop

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::{json, Value as JsonValue};

    use streambus_core::EntryId;
    use streambus_events::{
        event_types, handler_fn, DeadLetterEntry, Event, EventRecord, InboundEvent, SchemaRegistry,
        StreamFields,
    };

    use crate::config::BusConfig;
    use crate::consumer::EventConsumerService;
    use crate::dead_letter::{DeadLetterService, ReprocessReport};
    use crate::publisher::{EventPublisher, PublishReceipt};
    use crate::stream_log::{InMemoryStreamLog, ReadFrom, StreamLog};

    const SYSTEM: &str = "events:system";
    const ATTEMPTS: &str = "events:attempts";
    const DLQ: &str = "events:dead-letter";

    struct Bus {
        log: InMemoryStreamLog,
        config: BusConfig,
        consumers: EventConsumerService,
        dead_letters: DeadLetterService,
    }

    fn setup() -> Bus {
        setup_with(BusConfig::for_tests())
    }

    fn setup_with(config: BusConfig) -> Bus {
        let log = InMemoryStreamLog::new();
        let registry = Arc::new(SchemaRegistry::with_builtin_schemas());
        let consumers = EventConsumerService::new(Arc::new(log.clone()), registry, config.clone());
        let dead_letters = DeadLetterService::new(Arc::new(log.clone()), config.clone());
        Bus {
            log,
            config,
            consumers,
            dead_letters,
        }
    }

    impl Bus {
        fn publisher(&self, stream: &str) -> EventPublisher {
            let stream = self
                .config
                .streams
                .find(stream)
                .cloned()
                .unwrap_or_else(|| panic!("unknown stream {stream}"));
            EventPublisher::new(
                Arc::new(self.log.clone()),
                Arc::new(SchemaRegistry::with_builtin_schemas()),
                stream,
                self.config.publisher.clone(),
            )
        }

        async fn pending(&self, stream: &str) -> u64 {
            let group = &self.config.streams.find(stream).unwrap().consumer_group;
            self.log
                .group_info(stream)
                .await
                .unwrap()
                .into_iter()
                .find(|g| &g.name == group)
                .map(|g| g.pending)
                .unwrap_or(0)
        }

        async fn quarantined(&self) -> Vec<DeadLetterEntry> {
            self.dead_letters.list_entries(100).await.unwrap()
        }
    }

    /// Poll `check` until it holds or two seconds pass.
    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn recording_handler(
        seen: Arc<Mutex<Vec<InboundEvent>>>,
    ) -> impl streambus_events::EventHandler + 'static {
        handler_fn(move |event: InboundEvent| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(event);
                Ok(())
            }
        })
    }

    fn health_check(data: JsonValue) -> Event {
        Event::new(event_types::SYSTEM_HEALTH_CHECK, "monitor", data)
    }

    #[tokio::test]
    async fn published_event_is_handled_and_acknowledged() {
        let bus = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.consumers
            .register_handler(event_types::SYSTEM_HEALTH_CHECK, recording_handler(seen.clone()));
        bus.consumers.start().await.unwrap();

        let data = json!({"service": "scheduler", "status": "healthy", "checks": {}});
        let receipt = bus
            .publisher(SYSTEM)
            .publish_event(health_check(data.clone()))
            .await
            .unwrap();
        assert!(!receipt.is_buffered());

        assert!(eventually(|| async { seen.lock().unwrap().len() == 1 }).await);
        assert!(eventually(|| async { bus.pending(SYSTEM).await == 0 }).await);
        bus.consumers.stop().await;

        let handled = seen.lock().unwrap()[0].clone();
        assert_eq!(handled.data, data);
        assert_eq!(handled.event_id, Some(receipt.event_id().to_string()));
        assert!(bus.quarantined().await.is_empty());
        assert_eq!(bus.consumers.stats().acknowledged, 1);
    }

    #[tokio::test]
    async fn unknown_event_type_is_dead_lettered() {
        let bus = setup();
        bus.consumers.start().await.unwrap();

        let fields = EventRecord::bare("system.mystery", json!({"x": 1})).pack();
        bus.log.append(SYSTEM, &fields, None).await.unwrap();

        assert!(eventually(|| async { bus.quarantined().await.len() == 1 }).await);
        assert!(eventually(|| async { bus.pending(SYSTEM).await == 0 }).await);
        bus.consumers.stop().await;

        let dead = &bus.quarantined().await[0];
        assert!(dead.error.starts_with("Validation failed: "));
        assert_eq!(dead.event_type, "system.mystery");
        assert_eq!(dead.original_stream, SYSTEM);
        assert_eq!(dead.retry_count, 0);
    }

    #[tokio::test]
    async fn health_check_missing_checks_is_dead_lettered() {
        let bus = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        bus.consumers.register_handler(
            event_types::SYSTEM_HEALTH_CHECK,
            handler_fn(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
        );
        bus.consumers.start().await.unwrap();

        // The publisher validates first, so the bad payload goes straight to the log.
        let fields = EventRecord::bare(
            event_types::SYSTEM_HEALTH_CHECK,
            json!({"service": "scheduler", "status": "healthy"}),
        )
        .pack();
        bus.log.append(SYSTEM, &fields, None).await.unwrap();

        assert!(eventually(|| async { bus.quarantined().await.len() == 1 }).await);
        bus.consumers.stop().await;

        let dead = &bus.quarantined().await[0];
        assert_eq!(dead.event_type, event_types::SYSTEM_HEALTH_CHECK);
        assert!(dead.error.starts_with("Validation failed: "));
        assert!(dead.error.contains("validation"));
        assert!(dead.error.contains("checks"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn always_failing_handler_is_retried_then_quarantined() {
        let mut config = BusConfig::for_tests();
        config.consumers.get_mut("attempts").unwrap().retry_attempts = 3;
        let bus = setup_with(config);

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        bus.consumers.register_handler(
            event_types::ATTEMPT_FAILED,
            handler_fn(move |_| {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                async move { anyhow::bail!("downstream rejected attempt (call {n})") }
            }),
        );
        bus.consumers.start().await.unwrap();

        let event = Event::new(
            event_types::ATTEMPT_FAILED,
            "runner",
            json!({"attemptId": "a-1", "workItemId": "wi-1", "error": "timeout"}),
        );
        bus.publisher(ATTEMPTS).publish_event(event.clone()).await.unwrap();

        assert!(eventually(|| async { bus.quarantined().await.len() == 1 }).await);
        assert!(eventually(|| async { bus.pending(ATTEMPTS).await == 0 }).await);
        bus.consumers.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let dead = &bus.quarantined().await[0];
        assert_eq!(dead.retry_count, 4);
        assert_eq!(dead.original_event_id, event.id().to_string());
        assert!(dead.error.contains("call 4"));
        assert_eq!(bus.consumers.stats().handler_retries, 3);
    }

    #[tokio::test]
    async fn group_initialization_twice_leaves_one_group_per_stream() {
        let bus = setup();
        bus.consumers.initialize().await.unwrap();
        bus.consumers.initialize().await.unwrap();

        let stats = bus.consumers.consumer_stats().await.unwrap();
        assert_eq!(stats.len(), 4);
        for (stream, groups) in stats {
            assert_eq!(groups.len(), 1, "{stream}");
            assert_eq!(groups[0].last_delivered_id, EntryId::MIN);
        }
    }

    #[tokio::test]
    async fn reprocess_on_empty_dead_letter_stream_is_a_no_op() {
        let bus = setup();
        bus.dead_letters.initialize().await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                bus.dead_letters.reprocess_events(10).await.unwrap(),
                ReprocessReport { processed: 0, failed: 0 }
            );
        }
    }

    #[tokio::test]
    async fn quarantined_event_is_reprocessed_once_handler_is_fixed() {
        let bus = setup();
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handled = Arc::new(AtomicU32::new(0));
        let (h, ok) = (handled.clone(), healthy.clone());
        bus.consumers.register_handler(
            event_types::SYSTEM_SHUTDOWN,
            handler_fn(move |_| {
                let (h, ok) = (h.clone(), ok.clone());
                async move {
                    if !ok.load(Ordering::SeqCst) {
                        anyhow::bail!("shutdown coordinator unavailable");
                    }
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        bus.consumers.start().await.unwrap();

        bus.publisher(SYSTEM)
            .publish_event(Event::new(event_types::SYSTEM_SHUTDOWN, "ops", json!({"service": "scheduler", "reason": "deploy"})))
            .await
            .unwrap();
        assert!(eventually(|| async { bus.quarantined().await.len() == 1 }).await);

        healthy.store(true, Ordering::SeqCst);
        let report = bus.dead_letters.reprocess_events(10).await.unwrap();
        assert_eq!(report, ReprocessReport { processed: 1, failed: 0 });

        assert!(eventually(|| async { handled.load(Ordering::SeqCst) == 1 }).await);
        bus.consumers.stop().await;

        assert_eq!(bus.dead_letters.dead_letter_stats().await.unwrap().pending, 0);
        assert_eq!(bus.dead_letters.reprocess_events(10).await.unwrap(), ReprocessReport::default());
    }

    #[tokio::test]
    async fn clear_old_entries_removes_aged_dead_letters() {
        let bus = setup();
        assert_eq!(bus.dead_letters.clear_old_entries(0).await.unwrap(), 0);

        let record = EventRecord::bare(event_types::SYSTEM_SHUTDOWN, json!({}));
        let dead = DeadLetterEntry::handler_failure(&record, "evt-1", SYSTEM, "boom", 1);
        bus.log.append(DLQ, &dead.pack(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(bus.dead_letters.clear_old_entries(0).await.unwrap() >= 1);
        assert_eq!(bus.dead_letters.dead_letter_stats().await.unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn outage_is_absorbed_by_outbox_and_consumer() {
        let bus = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.consumers
            .register_handler(event_types::SYSTEM_HEALTH_CHECK, recording_handler(seen.clone()));
        bus.consumers.start().await.unwrap();
        let publisher = bus.publisher(SYSTEM);

        bus.log.set_available(false);
        let receipt = publisher
            .publish_event(health_check(json!({"service": "a", "status": "degraded", "checks": {}})))
            .await
            .unwrap();
        assert!(matches!(receipt, PublishReceipt::Buffered { .. }));
        tokio::time::sleep(Duration::from_millis(60)).await;

        bus.log.set_available(true);
        assert_eq!(publisher.flush_outbox().await.published, 1);

        assert!(eventually(|| async { seen.lock().unwrap().len() == 1 }).await);
        bus.consumers.stop().await;
        publisher.stop().await;

        let health = bus.consumers.health_status();
        assert!(!health.is_running);
        assert!(health.stats.loop_errors >= 1);
    }

    #[tokio::test]
    async fn entries_left_pending_by_a_crash_are_redelivered_on_start() {
        let bus = setup();
        bus.consumers.initialize().await.unwrap();
        let consumer = bus.config.consumers["system"].clone();

        let fields: StreamFields = EventRecord::bare(
            event_types::SYSTEM_HEALTH_CHECK,
            json!({"service": "a", "status": "healthy", "checks": {}}),
        )
        .pack();
        bus.log.append(SYSTEM, &fields, None).await.unwrap();

        // A previous incarnation read the entry and died before acknowledging.
        let delivered = bus
            .log
            .read_group(
                &consumer.group_name,
                &consumer.consumer_name,
                &consumer.streams,
                ReadFrom::New,
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(bus.pending(SYSTEM).await, 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.consumers
            .register_handler(event_types::SYSTEM_HEALTH_CHECK, recording_handler(seen.clone()));
        bus.consumers.start().await.unwrap();

        assert!(eventually(|| async { seen.lock().unwrap().len() == 1 }).await);
        assert!(eventually(|| async { bus.pending(SYSTEM).await == 0 }).await);
        bus.consumers.stop().await;

        assert_eq!(seen.lock().unwrap()[0].entry_id, delivered[0].id);
    }
}
