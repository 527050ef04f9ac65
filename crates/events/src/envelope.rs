//! Stream entry wire format.
//!
//! A log entry is a flat list of `(field, value)` string pairs. This module is
//! the only place that knows the field names: everything past the boundary
//! works with [`EventRecord`] (live streams) or
//! [`DeadLetterEntry`](crate::DeadLetterEntry) (quarantine stream).
//!
//! Live stream fields:
//!
//! | field       | required | content                              |
//! |-------------|----------|--------------------------------------|
//! | `eventType` | yes      | schema + handler key                 |
//! | `eventData` | yes      | JSON-serialized payload              |
//! | `eventId`   | no       | producer-assigned event id           |
//! | `outboxId`  | no       | outbox entry the append came from    |
//! | `source`    | no       | producing service                    |
//! | `version`   | no       | envelope version                     |
//! | `timestamp` | no       | RFC 3339 producer timestamp          |

use serde_json::Value as JsonValue;
use thiserror::Error;

use streambus_core::{EntryId, OutboxId};

use crate::event::Event;

pub const FIELD_EVENT_TYPE: &str = "eventType";
pub const FIELD_EVENT_DATA: &str = "eventData";
pub const FIELD_EVENT_ID: &str = "eventId";
pub const FIELD_OUTBOX_ID: &str = "outboxId";
pub const FIELD_SOURCE: &str = "source";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Malformed entry (structural failure).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Ordered flat field list, exactly as stored in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFields(Vec<(String, String)>);

impl StreamFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field. Later duplicates shadow earlier ones on lookup.
    pub fn push(&mut self, field: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.push((field.into(), value.into()));
        self
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(field, value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == field)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, field: &'static str) -> Result<&str, EnvelopeError> {
        self.get(field).ok_or(EnvelopeError::MissingField(field))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for StreamFields {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An entry as delivered by the log: its id, the stream it came from, and the
/// raw field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub stream: String,
    pub fields: StreamFields,
}

impl StreamEntry {
    pub fn new(id: EntryId, stream: impl Into<String>, fields: StreamFields) -> Self {
        Self {
            id,
            stream: stream.into(),
            fields,
        }
    }
}

/// Typed view of a live stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_type: String,
    pub event_data: JsonValue,
    pub event_id: Option<String>,
    pub outbox_id: Option<String>,
    pub source: Option<String>,
    pub version: Option<u32>,
    pub timestamp: Option<String>,
}

impl EventRecord {
    /// Record for an event appended directly by the publisher.
    pub fn from_event(event: &Event) -> Self {
        Self {
            event_type: event.event_type().to_string(),
            event_data: event.data().clone(),
            event_id: Some(event.id().to_string()),
            outbox_id: None,
            source: Some(event.source().to_string()),
            version: Some(event.version()),
            timestamp: Some(event.timestamp().to_rfc3339()),
        }
    }

    /// Record for an event appended by an outbox flush.
    pub fn from_outbox(event: &Event, outbox_id: OutboxId) -> Self {
        Self {
            outbox_id: Some(outbox_id.to_string()),
            ..Self::from_event(event)
        }
    }

    /// Minimal record with only the required fields.
    pub fn bare(event_type: impl Into<String>, event_data: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            event_data,
            event_id: None,
            outbox_id: None,
            source: None,
            version: None,
            timestamp: None,
        }
    }

    pub fn pack(&self) -> StreamFields {
        let mut fields = StreamFields::new();
        fields
            .push(FIELD_EVENT_TYPE, self.event_type.as_str())
            .push(FIELD_EVENT_DATA, self.event_data.to_string());

        if let Some(id) = &self.event_id {
            fields.push(FIELD_EVENT_ID, id.as_str());
        }
        if let Some(id) = &self.outbox_id {
            fields.push(FIELD_OUTBOX_ID, id.as_str());
        }
        if let Some(source) = &self.source {
            fields.push(FIELD_SOURCE, source.as_str());
        }
        if let Some(version) = self.version {
            fields.push(FIELD_VERSION, version.to_string());
        }
        if let Some(ts) = &self.timestamp {
            fields.push(FIELD_TIMESTAMP, ts.as_str());
        }

        fields
    }

    /// Decode a live entry.
    ///
    /// Only a missing `eventType` is structural. A missing or non-JSON
    /// `eventData` is carried through (as `null` or as the raw string) so the
    /// schema check rejects it and the entry lands in the dead-letter stream
    /// where it can still be inspected.
    pub fn unpack(fields: &StreamFields) -> Result<Self, EnvelopeError> {
        let event_type = fields.require(FIELD_EVENT_TYPE)?.to_string();
        if event_type.trim().is_empty() {
            return Err(EnvelopeError::InvalidField {
                field: FIELD_EVENT_TYPE,
                reason: "empty".to_string(),
            });
        }

        let event_data = match fields.get(FIELD_EVENT_DATA) {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string())),
            None => JsonValue::Null,
        };

        Ok(Self {
            event_type,
            event_data,
            event_id: fields.get(FIELD_EVENT_ID).map(str::to_string),
            outbox_id: fields.get(FIELD_OUTBOX_ID).map(str::to_string),
            source: fields.get(FIELD_SOURCE).map(str::to_string),
            version: fields.get(FIELD_VERSION).and_then(|v| v.parse().ok()),
            timestamp: fields.get(FIELD_TIMESTAMP).map(str::to_string),
        })
    }
}
