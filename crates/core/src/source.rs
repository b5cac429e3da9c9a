//! Aggregate identity and the compact type-code hash.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of the command (or causal trigger) that produced a batch of
/// events. Used for idempotent replay: re-appending a batch with the same
/// correlation id is a recognized no-op.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

/// Transport-level message identity, used by the handler idempotency ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(CorrelationId, "CorrelationId");
impl_uuid_newtype!(MessageId, "MessageId");

/// Compact 64-bit code derived from a fully-qualified type name.
///
/// `TypeCode` is FNV-1a over `namespace.type_name`. It is a **secondary**
/// key, cheap to compare and partition on, but hash
/// collisions are possible, so any identity decision must tie-break on the
/// canonical names. Nothing in this crate treats two types as equal because
/// their codes match.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeCode(u64);

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over a byte slice. Stable across platforms and releases; both the
/// persisted type code and partition assignment derive from it, so the
/// function must never change.
pub const fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

impl TypeCode {
    /// Compute the code for a `namespace` + `type_name` pair.
    pub fn of(namespace: &str, type_name: &str) -> Self {
        let mut hash = fnv1a64(namespace.as_bytes());
        hash ^= b'.' as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        for b in type_name.as_bytes() {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(hash)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for TypeCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identity of one aggregate instance: the fully-qualified aggregate type
/// plus its instance id.
///
/// Two keys are equal iff all four fields match. The derived [`TypeCode`]
/// is carried alongside persisted records as a compact partitioning/lookup
/// key; consumers must tolerate code collisions and compare names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    namespace: String,
    type_name: String,
    qualifier: String,
    source_id: String,
}

impl SourceKey {
    pub fn new(
        namespace: impl Into<String>,
        type_name: impl Into<String>,
        qualifier: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            type_name: type_name.into(),
            qualifier: qualifier.into(),
            source_id: source_id.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Compact code for the aggregate type (not the instance).
    pub fn type_code(&self) -> TypeCode {
        TypeCode::of(&self.namespace, &self.type_name)
    }

    /// True when both keys name the same aggregate *type*, compared by
    /// canonical names (never by code alone).
    pub fn same_type(&self, other: &SourceKey) -> bool {
        self.namespace == other.namespace && self.type_name == other.type_name
    }
}

impl core::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}.{}#{}",
            self.namespace, self.type_name, self.source_id
        )
    }
}
