//! Infrastructure layer: storage, distribution, and the command unit-of-work.
//!
//! Everything here is in-memory and synchronous by design. Durability
//! boundaries are traits (`EventStore`, `SnapshotStore`, `HandlerRecordStore`,
//! `PublishedVersionStore`), so a deployment can swap in persistent backends
//! without touching the domain or pipeline code.

pub mod aggregate_store;
pub mod checkpoint;
pub mod command;
pub mod event_store;
pub mod ledger;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod snapshot;
pub mod sync;

pub use aggregate_store::{AggregateStore, AggregateStoreError, Persistable, SaveOutcome};
pub use checkpoint::{CheckpointError, OffsetCheckpoint, OffsetDefault};
pub use command::{
    CommandContext, CommandResult, CommandStatus, ContextError, InMemoryPlainRepository,
    PlainEntity, PlainRepository, PlainStoreError, StoreRegistry, publish_command_result,
};
pub use event_store::{AppendOutcome, EventStore, EventStoreError, InMemoryEventStore};
pub use ledger::{HandlerRecord, HandlerRecordStore, InMemoryHandlerRecordStore, LedgerError};
pub use pipeline::{
    BatchSink, DeadLetterSink, EventPipeline, LogOnlyDeadLetter, NullSink, PipelineConfig,
    SinkError,
};
pub use retry::RetryPolicy;
pub use router::{OrderedQueue, PartitionWorkers, PartitionedRouter, WorkerHandle};
pub use snapshot::{
    EveryNVersions, InMemorySnapshotStore, NoSnapshots, Snapshot, SnapshotError, SnapshotPolicy,
    SnapshotStore,
};
pub use sync::{
    GateDecision, InMemoryPublishedVersionStore, PublishedVersionStore, RetryQueue, Synchronizer,
};

#[cfg(test)]
mod integration_tests;
