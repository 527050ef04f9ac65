//! Domain event envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use streambus_core::EventId;

/// Current envelope version stamped on newly created events.
pub const CURRENT_EVENT_VERSION: u32 = 1;

/// An event as handed to the publisher.
///
/// `event_type` keys both the schema used for validation and the handler used
/// for dispatch. `id` is assigned by the producer and is never the same thing
/// as the id the log assigns on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    #[serde(rename = "type")]
    event_type: String,
    timestamp: DateTime<Utc>,
    version: u32,
    source: String,
    data: JsonValue,
}

impl Event {
    /// Create a new event with a fresh id and the current timestamp.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: JsonValue) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            version: CURRENT_EVENT_VERSION,
            source: source.into(),
            data,
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn into_data(self) -> JsonValue {
        self.data
    }
}
