//! `eventum-core`: domain foundation for the event-sourcing runtime.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! aggregate identity, versioned event batches, the event-sourced aggregate
//! contract, and the shared error taxonomy.

pub mod aggregate;
pub mod error;
pub mod event;
pub mod source;

pub use aggregate::{EventSourced, PendingEvents, replay};
pub use error::{CoreError, CoreResult};
pub use event::{EventPayload, VersionedBatch};
pub use source::{CorrelationId, MessageId, SourceKey, TypeCode, fnv1a64};
