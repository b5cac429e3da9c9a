//! Consumer offset checkpointing for the external durable transport.
//!
//! Tracks, per topic and partition, the offset up to which messages have
//! been fully processed, so a restarted consumer resumes where it left off
//! instead of replaying from the beginning (safe, but slow) or from the tail
//! (fast, but lossy). Offsets are confirmed after processing, so a crash
//! between processing and confirmation replays a message; consumers are
//! idempotent and tolerate that.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use eventum_events::Topic;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint file malformed: {0}")]
    Malformed(String),
}

/// Where a consumer starts on a partition it has no checkpoint for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetDefault {
    /// Replay the partition from the start. The safe default: every
    /// consumer is idempotent, so over-reading only costs time.
    Earliest,
    /// Start at the tail; history is skipped.
    Latest,
    /// Start at a fixed offset.
    At(u64),
}

/// Per-topic, per-partition processed-offset map with atomic file
/// persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCheckpoint {
    offsets: BTreeMap<Topic, BTreeMap<u32, u64>>,
    default: OffsetDefault,
}

impl OffsetCheckpoint {
    pub fn new(default: OffsetDefault) -> Self {
        Self {
            offsets: BTreeMap::new(),
            default,
        }
    }

    pub fn default_position(&self) -> OffsetDefault {
        self.default
    }

    /// Confirm that everything up to and including `offset` is processed.
    /// Monotonic: a late confirmation below the watermark is ignored.
    pub fn confirm(&mut self, topic: Topic, partition: u32, offset: u64) {
        let entry = self
            .offsets
            .entry(topic)
            .or_default()
            .entry(partition)
            .or_insert(0);
        if offset > *entry {
            *entry = offset;
        }
    }

    /// Last confirmed offset, or `None` for an unseen topic/partition pair
    /// (resume per [`OffsetCheckpoint::default_position`]).
    pub fn position(&self, topic: Topic, partition: u32) -> Option<u64> {
        self.offsets
            .get(&topic)
            .and_then(|partitions| partitions.get(&partition))
            .copied()
    }

    /// Persist to `path` atomically: write a sibling temp file, flush, then
    /// rename over the target. A crash mid-save leaves the previous
    /// checkpoint intact.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| CheckpointError::Malformed(e.to_string()))?;

        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "checkpoint saved");
        Ok(())
    }

    /// Load from `path`; a missing file yields an empty checkpoint with the
    /// given default (first run). A present-but-unreadable file is an error,
    /// not a silent reset.
    pub fn load(path: &Path, default: OffsetDefault) -> Result<Self, CheckpointError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(default));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_is_monotonic_per_partition() {
        let mut checkpoint = OffsetCheckpoint::new(OffsetDefault::Earliest);
        checkpoint.confirm(Topic::EventStreams, 0, 10);
        checkpoint.confirm(Topic::EventStreams, 0, 7);
        checkpoint.confirm(Topic::EventStreams, 1, 3);

        assert_eq!(checkpoint.position(Topic::EventStreams, 0), Some(10));
        assert_eq!(checkpoint.position(Topic::EventStreams, 1), Some(3));
        assert_eq!(checkpoint.position(Topic::Commands, 0), None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        let mut checkpoint = OffsetCheckpoint::new(OffsetDefault::Latest);
        checkpoint.confirm(Topic::EventStreams, 0, 42);
        checkpoint.confirm(Topic::Commands, 3, 7);
        checkpoint.save(&path).unwrap();

        let loaded = OffsetCheckpoint::load(&path, OffsetDefault::Earliest).unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.default_position(), OffsetDefault::Latest);
    }

    #[test]
    fn missing_file_loads_empty_with_requested_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded =
            OffsetCheckpoint::load(&dir.path().join("absent.json"), OffsetDefault::Earliest)
                .unwrap();
        assert_eq!(loaded.position(Topic::EventStreams, 0), None);
        assert_eq!(loaded.default_position(), OffsetDefault::Earliest);
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        fs::write(&path, b"not json").unwrap();
        let err = OffsetCheckpoint::load(&path, OffsetDefault::Earliest).unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed(_)));
    }
}
