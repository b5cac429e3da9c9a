//! Aggregate snapshots: opt-in replay compaction.
//!
//! A snapshot is always at or behind the event log; loading an aggregate
//! replays every batch with a version greater than the snapshot's. Snapshot
//! failures are **non-fatal** everywhere: the event log remains the source
//! of truth, so a failed snapshot degrades to a longer replay, never to a
//! failed command.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use eventum_core::SourceKey;

/// Serialized aggregate state at a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub source_key: SourceKey,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub state: JsonValue,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot storage failure: {0}")]
    Storage(String),
}

/// Snapshot persistence boundary.
pub trait SnapshotStore: Send + Sync {
    fn latest(&self, key: &SourceKey) -> Result<Option<Snapshot>, SnapshotError>;

    /// Returns `false` when an equal-or-newer snapshot already exists.
    fn save(&self, snapshot: Snapshot) -> Result<bool, SnapshotError>;

    fn remove(&self, key: &SourceKey) -> Result<bool, SnapshotError>;
}

/// Decides whether a save warrants a new snapshot. Pure predicate.
pub trait SnapshotPolicy: Send + Sync {
    fn should_snapshot(&self, candidate: &Snapshot) -> bool;
}

/// Default policy: snapshotting is opt-in, so never snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSnapshots;

impl SnapshotPolicy for NoSnapshots {
    fn should_snapshot(&self, _candidate: &Snapshot) -> bool {
        false
    }
}

/// Snapshot whenever the version is a multiple of `n`.
#[derive(Debug, Clone, Copy)]
pub struct EveryNVersions {
    n: u64,
}

impl EveryNVersions {
    /// `n` is clamped to at least 1.
    pub fn new(n: u64) -> Self {
        Self { n: n.max(1) }
    }
}

impl SnapshotPolicy for EveryNVersions {
    fn should_snapshot(&self, candidate: &Snapshot) -> bool {
        candidate.version % self.n == 0
    }
}

/// In-memory snapshot store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<SourceKey, Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn latest(&self, key: &SourceKey) -> Result<Option<Snapshot>, SnapshotError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| SnapshotError::Storage("lock poisoned".to_string()))?;
        Ok(snapshots.get(key).cloned())
    }

    fn save(&self, snapshot: Snapshot) -> Result<bool, SnapshotError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| SnapshotError::Storage("lock poisoned".to_string()))?;

        match snapshots.get(&snapshot.source_key) {
            Some(existing) if existing.version >= snapshot.version => Ok(false),
            _ => {
                snapshots.insert(snapshot.source_key.clone(), snapshot);
                Ok(true)
            }
        }
    }

    fn remove(&self, key: &SourceKey) -> Result<bool, SnapshotError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| SnapshotError::Storage("lock poisoned".to_string()))?;
        Ok(snapshots.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(version: u64) -> Snapshot {
        Snapshot {
            source_key: SourceKey::new("orders", "Order", "eventum", "42"),
            version,
            timestamp: Utc::now(),
            state: json!({ "total": version }),
        }
    }

    #[test]
    fn save_keeps_the_newest_version() {
        let store = InMemorySnapshotStore::new();
        assert!(store.save(snapshot(10)).unwrap());
        assert!(!store.save(snapshot(5)).unwrap());

        let latest = store.latest(&snapshot(0).source_key).unwrap().unwrap();
        assert_eq!(latest.version, 10);
    }

    #[test]
    fn default_policy_never_snapshots() {
        assert!(!NoSnapshots.should_snapshot(&snapshot(100)));
    }

    #[test]
    fn interval_policy_fires_on_multiples() {
        let policy = EveryNVersions::new(10);
        assert!(policy.should_snapshot(&snapshot(10)));
        assert!(policy.should_snapshot(&snapshot(20)));
        assert!(!policy.should_snapshot(&snapshot(11)));
    }

    #[test]
    fn remove_reports_presence() {
        let store = InMemorySnapshotStore::new();
        let key = snapshot(0).source_key;
        assert!(!store.remove(&key).unwrap());
        store.save(snapshot(1)).unwrap();
        assert!(store.remove(&key).unwrap());
    }
}
