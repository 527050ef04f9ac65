//! Dead-letter record and its wire form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use streambus_core::DeadLetterId;

use crate::envelope::{EnvelopeError, EventRecord, StreamFields, FIELD_EVENT_DATA, FIELD_EVENT_TYPE};

pub const FIELD_DEAD_LETTER_ID: &str = "deadLetterId";
pub const FIELD_ORIGINAL_EVENT_ID: &str = "originalEventId";
pub const FIELD_ORIGINAL_STREAM: &str = "originalStream";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_FAILED_AT: &str = "failedAt";
pub const FIELD_RETRY_COUNT: &str = "retryCount";

/// Prefix of the `error` field for schema rejections.
pub const VALIDATION_FAILED_PREFIX: &str = "Validation failed: ";

/// Terminal-failure record for one event.
///
/// `retry_count` is the number of handler invocations made before giving up
/// (`0` for schema rejections, which are never dispatched).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub original_event_id: String,
    pub event_type: String,
    pub event_data: JsonValue,
    pub original_stream: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl DeadLetterEntry {
    /// Quarantine record for a payload rejected by its schema.
    pub fn validation_failure(
        record: &EventRecord,
        original_event_id: impl Into<String>,
        original_stream: impl Into<String>,
        errors: &[String],
    ) -> Self {
        Self::new(
            record,
            original_event_id,
            original_stream,
            format!("{VALIDATION_FAILED_PREFIX}{}", errors.join(", ")),
            0,
        )
    }

    /// Quarantine record for a handler that kept failing.
    pub fn handler_failure(
        record: &EventRecord,
        original_event_id: impl Into<String>,
        original_stream: impl Into<String>,
        last_error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self::new(record, original_event_id, original_stream, last_error, attempts)
    }

    fn new(
        record: &EventRecord,
        original_event_id: impl Into<String>,
        original_stream: impl Into<String>,
        error: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            original_event_id: original_event_id.into(),
            event_type: record.event_type.clone(),
            event_data: record.event_data.clone(),
            original_stream: original_stream.into(),
            error: error.into(),
            failed_at: Utc::now(),
            retry_count,
        }
    }

    /// Live-stream record used when the entry is resubmitted to its origin.
    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            event_id: Some(self.original_event_id.clone()),
            ..EventRecord::bare(self.event_type.clone(), self.event_data.clone())
        }
    }

    pub fn pack(&self) -> StreamFields {
        StreamFields::new()
            .with(FIELD_DEAD_LETTER_ID, self.id.to_string())
            .with(FIELD_EVENT_TYPE, self.event_type.as_str())
            .with(FIELD_EVENT_DATA, self.event_data.to_string())
            .with(FIELD_ORIGINAL_EVENT_ID, self.original_event_id.as_str())
            .with(FIELD_ORIGINAL_STREAM, self.original_stream.as_str())
            .with(FIELD_ERROR, self.error.as_str())
            .with(FIELD_FAILED_AT, self.failed_at.to_rfc3339())
            .with(FIELD_RETRY_COUNT, self.retry_count.to_string())
    }

    pub fn unpack(fields: &StreamFields) -> Result<Self, EnvelopeError> {
        let id = fields
            .require(FIELD_DEAD_LETTER_ID)?
            .parse::<DeadLetterId>()
            .map_err(|e| invalid(FIELD_DEAD_LETTER_ID, e))?;

        let raw_data = fields.require(FIELD_EVENT_DATA)?;
        let event_data = serde_json::from_str(raw_data)
            .unwrap_or_else(|_| JsonValue::String(raw_data.to_string()));

        let failed_at = DateTime::parse_from_rfc3339(fields.require(FIELD_FAILED_AT)?)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| invalid(FIELD_FAILED_AT, e))?;

        let retry_count = fields
            .require(FIELD_RETRY_COUNT)?
            .parse::<u32>()
            .map_err(|e| invalid(FIELD_RETRY_COUNT, e))?;

        Ok(Self {
            id,
            original_event_id: fields.require(FIELD_ORIGINAL_EVENT_ID)?.to_string(),
            event_type: fields.require(FIELD_EVENT_TYPE)?.to_string(),
            event_data,
            original_stream: fields.require(FIELD_ORIGINAL_STREAM)?.to_string(),
            error: fields.require(FIELD_ERROR)?.to_string(),
            failed_at,
            retry_count,
        })
    }

    pub fn is_validation_failure(&self) -> bool {
        self.error.starts_with(VALIDATION_FAILED_PREFIX)
    }
}

fn invalid(field: &'static str, err: impl core::fmt::Display) -> EnvelopeError {
    EnvelopeError::InvalidField {
        field,
        reason: err.to_string(),
    }
}
