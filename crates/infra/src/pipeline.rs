//! The event distribution pipeline.
//!
//! Wires the partitioned router, the version-gated synchronizer, the typed
//! handler registry, and the idempotency ledger into one unit: the
//! aggregate store hands persisted batches to [`EventPipeline::accept`],
//! partition workers gate and dispatch them, and successfully dispatched
//! batches are re-published downstream on the `EventStreams` topic.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use eventum_core::{MessageId, TypeCode, VersionedBatch, fnv1a64};
use eventum_events::{EnvelopePublisher, HandlerRegistry, MessageEnvelope, Topic};

use crate::ledger::{HandlerRecord, HandlerRecordStore};
use crate::retry::RetryPolicy;
use crate::router::{PartitionWorkers, PartitionedRouter, WorkerHandle};
use crate::sync::{GateDecision, PublishedVersionStore, RetryQueue, Synchronizer};

/// Handing a batch to the pipeline failed.
#[derive(Debug, Error, Clone)]
pub enum SinkError {
    #[error("pipeline is shut down")]
    Closed,
}

/// Where the aggregate store publishes persisted batches. The pipeline is
/// the production implementation; [`NullSink`] serves stores that run
/// without distribution (tests, offline rebuilds).
pub trait BatchSink: Send + Sync {
    fn accept(&self, batch: VersionedBatch) -> Result<(), SinkError>;
}

/// Discards every batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl BatchSink for NullSink {
    fn accept(&self, _batch: VersionedBatch) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Receives batches the pipeline has given up on: a predecessor that never
/// arrived, or a handler that keeps failing.
pub trait DeadLetterSink: Send + Sync {
    fn dead_letter(&self, batch: VersionedBatch, attempts: u32);
}

/// Default dead-letter sink: the alarm is the error log entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyDeadLetter;

impl DeadLetterSink for LogOnlyDeadLetter {
    fn dead_letter(&self, batch: VersionedBatch, attempts: u32) {
        error!(
            key = %batch.source_key(),
            start = batch.start_version(),
            end = batch.end_version(),
            attempts,
            "batch dead-lettered"
        );
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of partition queues/workers. Default: available parallelism.
    pub partitions: usize,
    /// Partition queue capacity; `None` for unbounded. Bounded queues block
    /// the producer when full.
    pub queue_capacity: Option<usize>,
    /// Delay before an `Awaited` batch is re-attempted.
    pub retry_delay: std::time::Duration,
    /// Retry queue capacity.
    pub retry_queue_capacity: usize,
    /// Requeue ceiling for a persistently `Awaited` batch. Once exceeded,
    /// the batch goes to the dead-letter sink instead of retrying forever.
    pub max_requeues: u32,
    /// Bounded retry for transient ledger/handler failures.
    pub retry_policy: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: PartitionedRouter::<RoutedBatch>::default_partitions(),
            queue_capacity: Some(1024),
            retry_delay: std::time::Duration::from_secs(5),
            retry_queue_capacity: 1024,
            max_requeues: 60,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// A batch in flight through the pipeline, with its requeue count.
#[derive(Debug)]
pub struct RoutedBatch {
    batch: VersionedBatch,
    attempts: u32,
}

/// Stable message identity for a batch, derived from its stream position.
///
/// A redelivered batch (transport retry, retry queue) must produce the same
/// id, or the idempotency ledger could not recognize it. The id is a
/// pure function of `(source key, start version)`, not a fresh UUID.
pub fn batch_message_id(batch: &VersionedBatch) -> MessageId {
    let key_hash = fnv1a64(batch.source_key().to_string().as_bytes());
    MessageId::from_uuid(Uuid::from_u64_pair(key_hash, batch.start_version()))
}

/// Message type code recorded in the ledger for versioned batches.
pub fn batch_message_code() -> TypeCode {
    TypeCode::of("eventum", "VersionedBatch")
}

struct PipelineInner {
    registry: Arc<HandlerRegistry>,
    ledger: Arc<dyn HandlerRecordStore>,
    sync: Synchronizer,
    publisher: Arc<dyn EnvelopePublisher>,
    dead_letter: Arc<dyn DeadLetterSink>,
    retry: RetryQueue<VersionedBatch>,
    max_requeues: u32,
    retry_policy: RetryPolicy,
}

impl PipelineInner {
    fn process(&self, routed: RoutedBatch) {
        let RoutedBatch { batch, attempts } = routed;
        match self.sync.gate(&batch) {
            GateDecision::Obsoleted { .. } => {
                // Duplicate delivery; gate already traced it.
            }
            GateDecision::Awaited { .. } => {
                if attempts >= self.max_requeues {
                    error!(
                        key = %batch.source_key(),
                        start = batch.start_version(),
                        attempts,
                        "predecessor batch still missing after max requeues"
                    );
                    self.dead_letter.dead_letter(batch, attempts);
                } else {
                    self.retry.push(batch, attempts + 1);
                }
            }
            GateDecision::Ready => self.dispatch(batch, attempts),
        }
    }

    fn dispatch(&self, batch: VersionedBatch, attempts: u32) {
        let message_id = batch_message_id(&batch);
        let message_code = batch_message_code();
        let mut any_failed = false;

        for registration in self.registry.resolve(&batch) {
            let handler_code = registration.handler().code();

            let seen = self
                .retry_policy
                .run("ledger exists", |_| true, || {
                    self.ledger.exists(message_id, message_code, handler_code)
                })
                .unwrap_or_else(|e| {
                    // Treat an unreadable ledger as "not seen": a duplicate
                    // invocation is the at-least-once contract; a skipped
                    // one would be a lost event.
                    warn!(error = %e, "ledger check failed; invoking handler anyway");
                    false
                });
            if seen {
                debug!(
                    handler = %registration.handler(),
                    message = %message_id,
                    "handler already executed for this message; skipping"
                );
                continue;
            }

            let result = self.retry_policy.run(
                "handler invocation",
                |e: &eventum_events::HandlerError| e.is_transient(),
                || registration.invoke(batch.end_version(), batch.payloads()),
            );
            match result {
                Ok(()) => {
                    if let Err(e) = self.ledger.record(HandlerRecord::new(
                        message_id,
                        message_code,
                        handler_code,
                    )) {
                        // The handler ran; a lost record only risks one
                        // duplicate invocation on redelivery.
                        warn!(error = %e, handler = %registration.handler(), "ledger record failed");
                    }
                }
                Err(e) => {
                    error!(
                        handler = %registration.handler(),
                        key = %batch.source_key(),
                        error = %e,
                        "handler failed after retries"
                    );
                    any_failed = true;
                }
            }
        }

        // Advance even when a handler failed: parking the stream would turn
        // one bad handler into a wedged aggregate. The failure is alarmed
        // and the batch preserved via the dead-letter sink.
        self.sync.mark_dispatched(&batch);
        if any_failed {
            self.dead_letter.dead_letter(batch.clone(), attempts);
        }

        self.republish(&batch, message_id);
    }

    /// Downstream re-publication on the `EventStreams` topic. The batch is
    /// already durable, so failures here degrade to at-least-once redelivery
    /// from the transport, never to loss.
    fn republish(&self, batch: &VersionedBatch, message_id: MessageId) {
        let payload = match serde_json::to_value(batch) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %batch.source_key(), error = %e, "batch envelope serialization failed");
                return;
            }
        };
        let mut envelope = MessageEnvelope::new(
            message_id,
            Topic::EventStreams,
            batch.source_key().source_id(),
            "eventum",
            "eventum",
            "VersionedBatch",
            payload,
        )
        .with_metadata("start_version", batch.start_version().to_string())
        .with_metadata("end_version", batch.end_version().to_string());
        if let Some(correlation) = batch.correlation_id() {
            envelope = envelope.with_metadata("correlation_id", correlation.to_string());
        }
        if let Err(e) = self.publisher.publish_envelope(envelope) {
            warn!(key = %batch.source_key(), error = %e, "downstream re-publication failed");
        }
    }
}

/// The running distribution pipeline.
///
/// One worker per partition plus one retry-queue consumer. Shut down with
/// [`EventPipeline::shutdown`]; batches accepted after shutdown are
/// rejected with [`SinkError::Closed`].
pub struct EventPipeline {
    router: Arc<PartitionedRouter<RoutedBatch>>,
    inner: Arc<PipelineInner>,
    workers: Mutex<Option<(PartitionWorkers, WorkerHandle)>>,
}

impl EventPipeline {
    pub fn start(
        config: PipelineConfig,
        registry: Arc<HandlerRegistry>,
        ledger: Arc<dyn HandlerRecordStore>,
        cursors: Arc<dyn PublishedVersionStore>,
        publisher: Arc<dyn EnvelopePublisher>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> Arc<Self> {
        let router = Arc::new(PartitionedRouter::new(
            config.partitions,
            config.queue_capacity,
        ));
        let inner = Arc::new(PipelineInner {
            registry,
            ledger,
            sync: Synchronizer::new(cursors),
            publisher,
            dead_letter,
            retry: RetryQueue::new(config.retry_queue_capacity, config.retry_delay),
            max_requeues: config.max_requeues,
            retry_policy: config.retry_policy,
        });

        let worker_inner = inner.clone();
        let workers = PartitionWorkers::spawn(
            "event-pipeline",
            &router,
            Arc::new(move |_partition, routed: RoutedBatch| {
                worker_inner.process(routed);
                Ok::<(), std::convert::Infallible>(())
            }),
        );

        let retry_router = router.clone();
        let retry_consumer = inner.retry.spawn_consumer("event-pipeline-retry", move |batch, attempts| {
            let routing_key = batch.source_key().source_id().to_string();
            retry_router.route(&routing_key, RoutedBatch { batch, attempts });
        });

        Arc::new(Self {
            router,
            inner,
            workers: Mutex::new(Some((workers, retry_consumer))),
        })
    }

    /// Published-version cursor for a key, mostly for tests and operations.
    pub fn published_version(&self, key: &eventum_core::SourceKey) -> u64 {
        self.inner.sync.published_version(key)
    }

    /// Stop accepting work, drain shutdown signals, and join all workers.
    pub fn shutdown(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            if let Some((partition_workers, retry_consumer)) = workers.take() {
                partition_workers.shutdown();
                retry_consumer.shutdown();
            }
        }
    }
}

impl BatchSink for EventPipeline {
    fn accept(&self, batch: VersionedBatch) -> Result<(), SinkError> {
        if self.workers.lock().map(|w| w.is_none()).unwrap_or(true) {
            return Err(SinkError::Closed);
        }
        let routing_key = batch.source_key().source_id().to_string();
        self.router.route(&routing_key, RoutedBatch { batch, attempts: 0 });
        Ok(())
    }
}
