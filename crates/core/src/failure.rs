//! Failure taxonomy.

use serde::{Deserialize, Serialize};

/// Classification of everything that can go wrong between publish and
/// acknowledgement.
///
/// Each kind has exactly one resolution, which is what keeps a consumer loop
/// alive no matter what a message does:
///
/// | kind         | resolution                                         |
/// |--------------|----------------------------------------------------|
/// | `Validation` | dead-lettered, never retried                       |
/// | `Structural` | acknowledged and dropped (nothing to replay)       |
/// | `Handler`    | retried with backoff, then dead-lettered           |
/// | `Transport`  | outbox on the producer side, sleep-and-resume on the consumer side |
/// | `Reprocess`  | left in the dead-letter stream for an operator     |
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Structural,
    Handler,
    Transport,
    Reprocess,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Structural => "structural",
            FailureKind::Handler => "handler",
            FailureKind::Transport => "transport",
            FailureKind::Reprocess => "reprocess",
        }
    }

    /// Whether the failure ends the message's life without a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureKind::Validation | FailureKind::Structural)
    }
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
