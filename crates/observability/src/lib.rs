//! Process-wide tracing/logging setup shared by bus binaries and services.

/// Initialize JSON logging for the process.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    crate::tracing::init_with(crate::tracing::LogFormat::from_env());
}

pub use crate::tracing::{init_with, LogFormat};

/// Tracing configuration (filters, layers).
pub mod tracing;
