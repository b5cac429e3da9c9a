use std::collections::HashMap;
use std::sync::RwLock;

use eventum_core::{CorrelationId, SourceKey, VersionedBatch};

use super::r#trait::{AppendOutcome, EventStore, EventStoreError};

/// In-memory append-only event store.
///
/// Intended for tests/dev and embedded deployments. Not optimized for
/// performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<SourceKey, Vec<VersionedBatch>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[VersionedBatch]) -> u64 {
        stream.last().map(|b| b.end_version()).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, batch: VersionedBatch) -> Result<AppendOutcome, EventStoreError> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let stream = streams.entry(batch.source_key().clone()).or_default();

        // Idempotent replay: the same command's events are already here.
        if let Some(correlation) = batch.correlation_id() {
            if stream
                .iter()
                .any(|b| b.correlation_id() == Some(correlation))
            {
                return Ok(AppendOutcome::DuplicateCorrelation);
            }
        }

        let current = Self::current_version(stream);
        if batch.start_version() != current + 1 {
            return Err(EventStoreError::VersionConflict {
                key: batch.source_key().to_string(),
                attempted: batch.start_version(),
                current,
            });
        }

        stream.push(batch);
        Ok(AppendOutcome::Appended)
    }

    fn find_by_correlation(
        &self,
        key: &SourceKey,
        correlation_id: CorrelationId,
    ) -> Result<Vec<VersionedBatch>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        Ok(streams
            .get(key)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|b| b.correlation_id() == Some(correlation_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn find_since(
        &self,
        key: &SourceKey,
        since_version: u64,
    ) -> Result<Vec<VersionedBatch>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        // Streams are stored in append order, which is ascending version order.
        Ok(streams
            .get(key)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|b| b.start_version() > since_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove_all(&self, key: &SourceKey) -> Result<(), EventStoreError> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        streams.remove(key);
        Ok(())
    }
}
