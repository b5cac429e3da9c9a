//! Handler idempotency ledger.
//!
//! Records which `(message, handler)` pairs already executed, so
//! at-least-once delivery can be treated as exactly-once from a handler's
//! perspective. The check happens before every invocation; the record is
//! written after a successful one.
//!
//! The check-then-record pair is deliberately **not** atomic across the two
//! store calls: a crash between them may re-run a handler once. Handlers
//! are required to tolerate a rare duplicate anyway, because the transport
//! itself may redeliver, so an atomic upsert would not buy a stronger
//! contract.

use std::collections::{HashSet, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use eventum_core::{MessageId, TypeCode};

/// One executed `(message, handler)` pair. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerRecord {
    pub message_id: MessageId,
    pub message_code: TypeCode,
    pub handler_code: TypeCode,
    pub timestamp: DateTime<Utc>,
}

impl HandlerRecord {
    pub fn new(message_id: MessageId, message_code: TypeCode, handler_code: TypeCode) -> Self {
        Self {
            message_id,
            message_code,
            handler_code,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage failure: {0}")]
    Storage(String),
}

/// Durable store of handler execution records.
pub trait HandlerRecordStore: Send + Sync {
    fn exists(
        &self,
        message_id: MessageId,
        message_code: TypeCode,
        handler_code: TypeCode,
    ) -> Result<bool, LedgerError>;

    fn record(&self, record: HandlerRecord) -> Result<(), LedgerError>;

    /// The most recent `limit` records, newest first. Used to warm an
    /// in-memory ledger at startup.
    fn recent(&self, limit: usize) -> Result<Vec<HandlerRecord>, LedgerError>;
}

/// In-memory ledger. Safe for concurrent use across independent keys; no
/// cross-key coordination exists to get wrong.
#[derive(Debug, Default)]
pub struct InMemoryHandlerRecordStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    seen: HashSet<(MessageId, TypeCode, TypeCode)>,
    log: VecDeque<HandlerRecord>,
}

impl InMemoryHandlerRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a durable store's most recent records (startup warm-up).
    pub fn warmed_with(records: Vec<HandlerRecord>) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.write() {
            for record in records {
                inner
                    .seen
                    .insert((record.message_id, record.message_code, record.handler_code));
                inner.log.push_back(record);
            }
        }
        store
    }
}

impl HandlerRecordStore for InMemoryHandlerRecordStore {
    fn exists(
        &self,
        message_id: MessageId,
        message_code: TypeCode,
        handler_code: TypeCode,
    ) -> Result<bool, LedgerError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        Ok(inner.seen.contains(&(message_id, message_code, handler_code)))
    }

    fn record(&self, record: HandlerRecord) -> Result<(), LedgerError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        inner
            .seen
            .insert((record.message_id, record.message_code, record.handler_code));
        inner.log.push_back(record);
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<HandlerRecord>, LedgerError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        Ok(inner.log.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes() -> (TypeCode, TypeCode) {
        (
            TypeCode::of("eventum", "VersionedBatch"),
            TypeCode::of("handlers", "PlacedHandler"),
        )
    }

    #[test]
    fn exists_after_record() {
        let store = InMemoryHandlerRecordStore::new();
        let (message_code, handler_code) = codes();
        let message_id = MessageId::new();

        assert!(!store.exists(message_id, message_code, handler_code).unwrap());
        store
            .record(HandlerRecord::new(message_id, message_code, handler_code))
            .unwrap();
        assert!(store.exists(message_id, message_code, handler_code).unwrap());
    }

    #[test]
    fn triple_is_discriminating() {
        let store = InMemoryHandlerRecordStore::new();
        let (message_code, handler_code) = codes();
        let message_id = MessageId::new();
        store
            .record(HandlerRecord::new(message_id, message_code, handler_code))
            .unwrap();

        let other_handler = TypeCode::of("handlers", "OtherHandler");
        assert!(!store.exists(message_id, message_code, other_handler).unwrap());
        assert!(!store.exists(MessageId::new(), message_code, handler_code).unwrap());
    }

    #[test]
    fn recent_returns_newest_first() {
        let store = InMemoryHandlerRecordStore::new();
        let (message_code, handler_code) = codes();
        let first = MessageId::new();
        let second = MessageId::new();
        store
            .record(HandlerRecord::new(first, message_code, handler_code))
            .unwrap();
        store
            .record(HandlerRecord::new(second, message_code, handler_code))
            .unwrap();

        let recent = store.recent(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message_id, second);
    }

    #[test]
    fn warmed_store_already_knows_its_records() {
        let (message_code, handler_code) = codes();
        let message_id = MessageId::new();
        let store = InMemoryHandlerRecordStore::warmed_with(vec![HandlerRecord::new(
            message_id,
            message_code,
            handler_code,
        )]);
        assert!(store.exists(message_id, message_code, handler_code).unwrap());
    }
}
