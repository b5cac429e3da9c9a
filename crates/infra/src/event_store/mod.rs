//! Append-only event store boundary.
//!
//! Defines the infrastructure-facing abstraction for storing and loading
//! per-aggregate event streams without making storage assumptions, plus an
//! in-memory implementation for tests/dev.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{AppendOutcome, EventStore, EventStoreError};
