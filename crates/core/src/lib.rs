//! Primitives shared by every bus component.
//!
//! This crate contains **pure** building blocks (no IO): identifiers, the
//! log entry id ordering, and the failure taxonomy used in logs and stats.

pub mod error;
pub mod failure;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use failure::FailureKind;
pub use id::{DeadLetterId, EntryId, EventId, OutboxId};
