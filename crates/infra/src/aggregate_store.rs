//! Event-sourced repository: load via cache → snapshot → replay, save via
//! append → publish → maybe snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, error, warn};

use eventum_core::{CoreError, CorrelationId, EventSourced, SourceKey, VersionedBatch, replay};

use crate::event_store::{AppendOutcome, EventStore, EventStoreError};
use crate::pipeline::{BatchSink, SinkError};
use crate::snapshot::{Snapshot, SnapshotPolicy, SnapshotStore};

/// Bound alias for aggregates the store can cache and snapshot.
pub trait Persistable: EventSourced + Clone + Serialize + DeserializeOwned + 'static {}

impl<T> Persistable for T where T: EventSourced + Clone + Serialize + DeserializeOwned + 'static {}

#[derive(Debug, Error)]
pub enum AggregateStoreError {
    /// Fatal domain failure: replay gaps, malformed batches. Data-corruption
    /// signals, never retried.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Event store failure. Logged and rethrown; this path is fatal because
    /// silently losing an event is worse than failing the command.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Handing the persisted batch to the distribution pipeline failed. The
    /// events are durable; redelivery is the recovery path.
    #[error("publication failed: {0}")]
    Publish(#[from] SinkError),

    /// A duplicate append could not recover the previously persisted batch.
    #[error("duplicate correlation {correlation} on {key} but no persisted batch found")]
    MissingDuplicate { key: String, correlation: String },

    /// The event store reported a correlation duplicate for an append that
    /// carried no correlation id. Only correlated appends are deduplicated,
    /// so this is a broken store contract, not a replay.
    #[error("duplicate reported on {key} for an append without a correlation id")]
    UncorrelatedDuplicate { key: String },
}

/// Outcome of [`AggregateStore::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The batch that is now durable for this save: freshly appended, or
    /// re-read from the store when the correlation id had already been
    /// persisted (idempotent command replay).
    Saved(VersionedBatch),
    /// The aggregate had no pending events; nothing was written.
    NothingToSave,
}

/// Event-sourced repository for one aggregate type.
///
/// Owns references to the event store, snapshot store and policy, and the
/// distribution sink, but none of their storage. The cache is a simple
/// last-writer-wins map: concurrent loads of the same cold aggregate may
/// both hit storage, which is acceptable because persistence is idempotent
/// by correlation id, not because the cache deduplicates.
pub struct AggregateStore<A: Persistable> {
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    policy: Arc<dyn SnapshotPolicy>,
    sink: Arc<dyn BatchSink>,
    cache: RwLock<HashMap<String, A>>,
}

impl<A: Persistable> AggregateStore<A> {
    pub fn new(
        events: Arc<dyn EventStore>,
        snapshots: Arc<dyn SnapshotStore>,
        policy: Arc<dyn SnapshotPolicy>,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        Self {
            events,
            snapshots,
            policy,
            sink,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn key_for(source_id: &str) -> SourceKey {
        SourceKey::new(A::NAMESPACE, A::TYPE_NAME, A::QUALIFIER, source_id)
    }

    /// Load an aggregate: cache, then snapshot, then replay of everything
    /// newer than the snapshot. A fresh instance at version 0 is returned
    /// when nothing is stored.
    ///
    /// Snapshot-store failures fall back to a full replay with a warning.
    /// A version gap in the stored stream is fatal.
    pub fn find(&self, source_id: &str) -> Result<A, AggregateStoreError> {
        if let Ok(cache) = self.cache.read() {
            if let Some(aggregate) = cache.get(source_id) {
                return Ok(aggregate.clone());
            }
        }

        let key = Self::key_for(source_id);
        let mut aggregate = self.from_snapshot(&key, source_id);

        let batches = self.events.find_since(&key, aggregate.version()).map_err(|e| {
            error!(key = %key, error = %e, "event store read failed during load");
            e
        })?;
        replay(&mut aggregate, &batches)?;

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(source_id.to_string(), aggregate.clone());
        }
        Ok(aggregate)
    }

    /// Starting state for a load: the latest snapshot if one exists and
    /// deserializes, otherwise a fresh instance at version 0.
    fn from_snapshot(&self, key: &SourceKey, source_id: &str) -> A {
        match self.snapshots.latest(key) {
            Ok(Some(snapshot)) => match serde_json::from_value::<A>(snapshot.state.clone()) {
                Ok(mut aggregate) => {
                    aggregate.set_version(snapshot.version);
                    debug!(key = %key, version = snapshot.version, "loaded from snapshot");
                    aggregate
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "snapshot deserialization failed; replaying from version 0");
                    A::with_id(source_id)
                }
            },
            Ok(None) => A::with_id(source_id),
            Err(e) => {
                warn!(key = %key, error = %e, "snapshot store unavailable; replaying from version 0");
                A::with_id(source_id)
            }
        }
    }

    /// Persist the aggregate's pending events as one versioned batch, then
    /// hand the batch to the distribution pipeline.
    ///
    /// This is the sole event-publication point, and it runs strictly after
    /// the append succeeds (write-ahead discipline). A duplicate correlation
    /// id re-reads the already-persisted batch instead of re-deriving state,
    /// so a retried command converges on the same published event set.
    pub fn save(
        &self,
        aggregate: &mut A,
        correlation_id: Option<CorrelationId>,
    ) -> Result<SaveOutcome, AggregateStoreError> {
        if aggregate.pending().is_empty() {
            return Ok(SaveOutcome::NothingToSave);
        }

        let key = aggregate.source_key();
        let payloads = aggregate.pending_payloads()?;
        let batch = VersionedBatch::new(key.clone(), correlation_id, aggregate.version() + 1, payloads)?;

        let batch = match self.events.append(batch.clone()) {
            Ok(AppendOutcome::Appended) => batch,
            Ok(AppendOutcome::DuplicateCorrelation) => {
                let correlation = correlation_id.ok_or_else(|| {
                    AggregateStoreError::UncorrelatedDuplicate {
                        key: key.to_string(),
                    }
                })?;
                debug!(key = %key, correlation = %correlation, "duplicate command replay; reusing persisted batch");
                self.events
                    .find_by_correlation(&key, correlation)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| AggregateStoreError::MissingDuplicate {
                        key: key.to_string(),
                        correlation: correlation.to_string(),
                    })?
            }
            Err(e) => {
                error!(key = %key, error = %e, "event store append failed");
                return Err(e.into());
            }
        };

        aggregate.pending_mut().drain();
        aggregate.set_version(batch.end_version());
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(aggregate.source_id().to_string(), aggregate.clone());
        }

        self.sink.accept(batch.clone())?;

        self.maybe_snapshot(aggregate, &key);

        Ok(SaveOutcome::Saved(batch))
    }

    /// Best-effort snapshot after a successful save. Never blocks command
    /// completion: serialization and storage failures are warnings.
    fn maybe_snapshot(&self, aggregate: &A, key: &SourceKey) {
        let state = match serde_json::to_value(aggregate) {
            Ok(state) => state,
            Err(e) => {
                warn!(key = %key, error = %e, "snapshot serialization failed");
                return;
            }
        };
        let candidate = Snapshot {
            source_key: key.clone(),
            version: aggregate.version(),
            timestamp: Utc::now(),
            state,
        };
        if !self.policy.should_snapshot(&candidate) {
            return;
        }
        if let Err(e) = self.snapshots.save(candidate) {
            warn!(key = %key, error = %e, "snapshot save failed");
        }
    }

    /// Hard purge: cache, snapshot, and all events. Not a soft delete, and
    /// not transactional across the stores.
    pub fn remove(&self, source_id: &str) -> Result<(), AggregateStoreError> {
        let key = Self::key_for(source_id);

        if let Ok(mut cache) = self.cache.write() {
            cache.remove(source_id);
        }
        if let Err(e) = self.snapshots.remove(&key) {
            warn!(key = %key, error = %e, "snapshot remove failed during delete");
        }
        self.events.remove_all(&key)?;
        Ok(())
    }

    /// Drop a cached instance without touching storage.
    pub fn evict(&self, source_id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(source_id);
        }
    }
}
