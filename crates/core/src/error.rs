//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while parsing or constructing core primitives.
///
/// Keep this focused on deterministic failures (malformed identifiers).
/// Transport and handler failures belong to the crates that perform the IO.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A log entry id did not follow the `<millis>-<sequence>` form.
    #[error("invalid stream entry id: {0}")]
    InvalidEntryId(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_entry_id(msg: impl Into<String>) -> Self {
        Self::InvalidEntryId(msg.into())
    }
}
