//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of the event-sourcing model
/// itself (batch shape, replay sequencing, command invariants). Infrastructure
/// concerns (storage, transport) belong to the infra layer.
///
/// Everything here is **fatal and non-retryable**: a version gap during replay
/// or two aggregates mutated by one command signals a programming error or
/// data corruption, and retrying cannot repair either.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A versioned batch failed its construction invariant.
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    /// Replay encountered a batch whose start version does not continue the
    /// aggregate's current version (gap or overlap in the stored stream).
    #[error("version sequence broken for {key}: expected {expected}, found {found}")]
    VersionGap {
        key: String,
        expected: u64,
        found: u64,
    },

    /// A stored payload could not be deserialized into the aggregate's event type.
    #[error("event deserialization failed: {0}")]
    Deserialize(String),

    /// A single command created or modified more than one aggregate.
    #[error("command {correlation} changed {count} aggregates; at most one may change per command")]
    MultipleAggregatesChanged { correlation: String, count: usize },

    /// An aggregate type was used without being registered with the runtime.
    #[error("unknown aggregate type: {0}")]
    UnknownAggregateType(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn malformed_batch(msg: impl Into<String>) -> Self {
        Self::MalformedBatch(msg.into())
    }

    pub fn deserialize(msg: impl Into<String>) -> Self {
        Self::Deserialize(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
