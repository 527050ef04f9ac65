//! Business handler contract and the per-service handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use streambus_core::EntryId;

/// An event as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub entry_id: EntryId,
    pub stream: String,
    pub event_type: String,
    /// Producer-side id, when the entry carried one.
    pub event_id: Option<String>,
    pub data: JsonValue,
}

impl InboundEvent {
    /// Id to correlate logs and dead-letter records with: the producer id
    /// when present, otherwise the log id.
    pub fn correlation_id(&self) -> String {
        self.event_id
            .clone()
            .unwrap_or_else(|| self.entry_id.to_string())
    }
}

/// Handles one event type.
///
/// Delivery is at-least-once: the same event can arrive again after a crash
/// or a retry, so implementations must be idempotent (or dedupe on
/// `event_id`). Returning `Err` counts as a failed attempt.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

/// Wrap a closure `Fn(InboundEvent) -> impl Future<Output = anyhow::Result<()>>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(InboundEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(InboundEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Event type → handler map owned by one consumer service.
///
/// One handler per type; registering again replaces the previous handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning `true` when it replaced an existing one.
    pub fn register(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(event_type.into(), handler).is_some()
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(event_type).cloned()
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<String> = handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
