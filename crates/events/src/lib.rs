//! Event envelope, wire format, schemas, handlers and
//! retry mechanics (no IO).

pub mod dead_letter;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod retry;
pub mod schema;

pub use dead_letter::DeadLetterEntry;
pub use envelope::{EnvelopeError, EventRecord, StreamEntry, StreamFields};
pub use event::Event;
pub use handler::{handler_fn, EventHandler, FnHandler, HandlerRegistry, InboundEvent};
pub use retry::{with_retry, Attempted, Backoff, RetryExhausted, RetryPolicy};
pub use schema::{event_types, EventSchema, FieldKind, SchemaRegistry, SchemaValidator, ValidationErrors};
