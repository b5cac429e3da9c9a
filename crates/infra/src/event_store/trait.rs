use std::sync::Arc;

use thiserror::Error;

use eventum_core::{CorrelationId, SourceKey, VersionedBatch};

/// Event store operation error.
///
/// These are **infrastructure** failures. A `VersionConflict` is the
/// optimistic-concurrency signal: some other writer appended to the stream
/// since this aggregate was loaded. `Storage` failures are fatal from the
/// store's perspective; the caller logs and rethrows rather than retrying,
/// because silently losing an event is worse than failing the command.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("version conflict on {key}: attempted start {attempted}, stream is at {current}")]
    VersionConflict {
        key: String,
        attempted: u64,
        current: u64,
    },

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Result of an append attempt.
///
/// `DuplicateCorrelation` is a recognized no-op, not an error: the same
/// command was executed twice (retried delivery), and its events are already
/// in the stream. The caller re-reads the persisted batch instead of
/// re-deriving state, so replays converge on the same published event set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    DuplicateCorrelation,
}

/// Append-only log of versioned event batches, keyed by [`SourceKey`].
///
/// Single-writer-per-key discipline is enforced upstream by the partitioned
/// router, not here; the store still detects version conflicts so a
/// misrouted concurrent writer fails loudly instead of corrupting a stream.
///
/// Implementations must:
/// - treat a repeated append for the same `(key, correlation_id)` as a no-op
///   (`AppendOutcome::DuplicateCorrelation`)
/// - reject an append whose `start_version` is not exactly
///   `current_version + 1` under a different correlation id
/// - return range reads ordered ascending by version
/// - make `append` atomic with respect to concurrent appends for the same key
pub trait EventStore: Send + Sync {
    /// Append a batch to its stream.
    fn append(&self, batch: VersionedBatch) -> Result<AppendOutcome, EventStoreError>;

    /// Retrieve a command's own batches, used to re-derive a result after a
    /// crash mid-save.
    fn find_by_correlation(
        &self,
        key: &SourceKey,
        correlation_id: CorrelationId,
    ) -> Result<Vec<VersionedBatch>, EventStoreError>;

    /// Batches with `start_version` strictly greater than `since_version`,
    /// ascending.
    fn find_since(
        &self,
        key: &SourceKey,
        since_version: u64,
    ) -> Result<Vec<VersionedBatch>, EventStoreError>;

    /// Hard purge of a stream. Used only on aggregate deletion; not
    /// transactional with other stores.
    fn remove_all(&self, key: &SourceKey) -> Result<(), EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(&self, batch: VersionedBatch) -> Result<AppendOutcome, EventStoreError> {
        (**self).append(batch)
    }

    fn find_by_correlation(
        &self,
        key: &SourceKey,
        correlation_id: CorrelationId,
    ) -> Result<Vec<VersionedBatch>, EventStoreError> {
        (**self).find_by_correlation(key, correlation_id)
    }

    fn find_since(
        &self,
        key: &SourceKey,
        since_version: u64,
    ) -> Result<Vec<VersionedBatch>, EventStoreError> {
        (**self).find_since(key, since_version)
    }

    fn remove_all(&self, key: &SourceKey) -> Result<(), EventStoreError> {
        (**self).remove_all(key)
    }
}
