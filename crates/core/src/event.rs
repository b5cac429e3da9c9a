//! Versioned event batches, the unit of persistence and distribution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use crate::error::{CoreError, CoreResult};
use crate::source::{CorrelationId, SourceKey, TypeCode};

/// One inner event of a batch, self-describing so a receiver can resolve the
/// concrete type without a shared schema registry.
///
/// `order` is the position within the batch. Consumers must apply payloads
/// in `order`, never regrouping or reordering by type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub order: u32,
    pub qualifier: String,
    pub namespace: String,
    pub type_name: String,
    pub body: JsonValue,
}

impl EventPayload {
    /// Serialize a typed event into a payload item.
    pub fn from_typed<E>(
        order: u32,
        qualifier: impl Into<String>,
        namespace: impl Into<String>,
        type_name: impl Into<String>,
        event: &E,
    ) -> CoreResult<Self>
    where
        E: Serialize,
    {
        let body = serde_json::to_value(event)
            .map_err(|e| CoreError::malformed_batch(format!("payload serialization failed: {e}")))?;
        Ok(Self {
            order,
            qualifier: qualifier.into(),
            namespace: namespace.into(),
            type_name: type_name.into(),
            body,
        })
    }

    /// Deserialize the body back into a typed event.
    pub fn to_typed<E>(&self) -> CoreResult<E>
    where
        E: DeserializeOwned,
    {
        serde_json::from_value(self.body.clone())
            .map_err(|e| CoreError::deserialize(format!("{}.{}: {e}", self.namespace, self.type_name)))
    }

    /// Compact code of the payload's event type.
    pub fn type_code(&self) -> TypeCode {
        TypeCode::of(&self.namespace, &self.type_name)
    }
}

/// An ordered batch of events produced by one mutation of one aggregate.
///
/// Invariants, enforced at construction:
/// - `payloads` is non-empty and `payloads[i].order == i`
/// - `start_version >= 1`
/// - `end_version == start_version + payloads.len() - 1`
///
/// `correlation_id` names the command that produced the batch; it is `None`
/// for mutations that happen outside a command, which also means there is no
/// idempotency key to deduplicate a re-append on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedBatch {
    source_key: SourceKey,
    correlation_id: Option<CorrelationId>,
    start_version: u64,
    end_version: u64,
    timestamp: DateTime<Utc>,
    payloads: Vec<EventPayload>,
}

impl VersionedBatch {
    pub fn new(
        source_key: SourceKey,
        correlation_id: Option<CorrelationId>,
        start_version: u64,
        payloads: Vec<EventPayload>,
    ) -> CoreResult<Self> {
        Self::with_timestamp(source_key, correlation_id, start_version, Utc::now(), payloads)
    }

    pub fn with_timestamp(
        source_key: SourceKey,
        correlation_id: Option<CorrelationId>,
        start_version: u64,
        timestamp: DateTime<Utc>,
        payloads: Vec<EventPayload>,
    ) -> CoreResult<Self> {
        if payloads.is_empty() {
            return Err(CoreError::malformed_batch("batch has no payloads"));
        }
        if start_version == 0 {
            return Err(CoreError::malformed_batch("start_version must be >= 1"));
        }
        for (idx, p) in payloads.iter().enumerate() {
            if p.order as usize != idx {
                return Err(CoreError::malformed_batch(format!(
                    "payload order mismatch at index {idx} (order={})",
                    p.order
                )));
            }
        }
        let end_version = start_version + payloads.len() as u64 - 1;
        Ok(Self {
            source_key,
            correlation_id,
            start_version,
            end_version,
            timestamp,
            payloads,
        })
    }

    pub fn source_key(&self) -> &SourceKey {
        &self.source_key
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn start_version(&self) -> u64 {
        self.start_version
    }

    pub fn end_version(&self) -> u64 {
        self.end_version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payloads(&self) -> &[EventPayload] {
        &self.payloads
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Sorted, deduplicated codes of the payload types in this batch.
    /// Used by the handler registry to resolve multi-event registrations.
    pub fn payload_type_codes(&self) -> Vec<TypeCode> {
        let mut codes: Vec<TypeCode> = self.payloads.iter().map(|p| p.type_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SourceKey {
        SourceKey::new("orders", "Order", "eventum", "42")
    }

    fn payload(order: u32, body: JsonValue) -> EventPayload {
        EventPayload {
            order,
            qualifier: "eventum".to_string(),
            namespace: "orders".to_string(),
            type_name: "Placed".to_string(),
            body,
        }
    }

    #[test]
    fn end_version_derived_from_payload_count() {
        let batch = VersionedBatch::new(
            key(),
            Some(CorrelationId::new()),
            3,
            vec![payload(0, serde_json::json!({})), payload(1, serde_json::json!({}))],
        )
        .unwrap();
        assert_eq!(batch.start_version(), 3);
        assert_eq!(batch.end_version(), 4);
    }

    #[test]
    fn rejects_empty_batch() {
        let err = VersionedBatch::new(key(), None, 1, vec![]).unwrap_err();
        assert!(matches!(err, CoreError::MalformedBatch(_)));
    }

    #[test]
    fn rejects_version_zero() {
        let err =
            VersionedBatch::new(key(), None, 0, vec![payload(0, serde_json::json!({}))]).unwrap_err();
        assert!(matches!(err, CoreError::MalformedBatch(_)));
    }

    #[test]
    fn rejects_out_of_order_payloads() {
        let err = VersionedBatch::new(
            key(),
            None,
            1,
            vec![payload(1, serde_json::json!({})), payload(0, serde_json::json!({}))],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::MalformedBatch(_)));
    }

    #[test]
    fn typed_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Placed {
            qty: u32,
        }
        let p = EventPayload::from_typed(0, "eventum", "orders", "Placed", &Placed { qty: 7 }).unwrap();
        assert_eq!(p.to_typed::<Placed>().unwrap(), Placed { qty: 7 });
    }
}
