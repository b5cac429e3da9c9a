//! Transport envelopes and the logical topic contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventum_core::{MessageId, TypeCode};

/// Logical topics exchanged with the external durable transport.
///
/// The transport's byte-level protocol is out of scope; only this
/// topic/offset contract is referenced.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    /// Versioned event batches flowing to downstream consumers.
    EventStreams,
    /// Command completion notifications (succeeded / unchanged / failed).
    CommandResults,
    /// Inbound commands.
    Commands,
    /// Explicit integration events queued by command handlers.
    Events,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::EventStreams => "EventStreams",
            Topic::CommandResults => "CommandResults",
            Topic::Commands => "Commands",
            Topic::Events => "Events",
        }
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for a message crossing the transport boundary.
///
/// Carries enough type metadata (`qualifier`, `namespace`, `type_name`) that
/// a receiver can resolve the concrete payload type without a shared schema
/// registry. The transport may deliver an envelope more than once, and out
/// of order across partitions; the `routing_key` pins related messages to
/// one ordered partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    message_id: MessageId,
    topic: Topic,
    routing_key: String,

    qualifier: String,
    namespace: String,
    type_name: String,

    metadata: BTreeMap<String, String>,
    payload: JsonValue,
}

impl MessageEnvelope {
    pub fn new(
        message_id: MessageId,
        topic: Topic,
        routing_key: impl Into<String>,
        qualifier: impl Into<String>,
        namespace: impl Into<String>,
        type_name: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            message_id,
            topic,
            routing_key: routing_key.into(),
            qualifier: qualifier.into(),
            namespace: namespace.into(),
            type_name: type_name.into(),
            metadata: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn type_code(&self) -> TypeCode {
        TypeCode::of(&self.namespace, &self.type_name)
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }
}
