//! Version-gated event-stream synchronization.
//!
//! The synchronizer decides, per incoming batch, whether the batch is ready
//! to dispatch, arrived ahead of a missing predecessor, or is a duplicate of
//! something already dispatched, judged against the per-aggregate
//! published-version cursor. `Awaited` and `Obsoleted` are expected
//! control-flow outcomes, not errors; they are traced at `debug` only.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use eventum_core::{SourceKey, VersionedBatch};

use crate::router::{OrderedQueue, WorkerHandle};

/// Per-aggregate watermark of the highest contiguous version whose events
/// have been fully dispatched to handlers.
///
/// Monotonic: `advance` never moves a cursor backwards. Distinct from the
/// aggregate's own version, which reflects persisted (not necessarily
/// dispatched) state. The synchronizer owns this store exclusively; no
/// other component may mutate it.
pub trait PublishedVersionStore: Send + Sync {
    /// Current cursor; 0 for a never-dispatched aggregate.
    fn get(&self, key: &SourceKey) -> u64;

    /// Raise the cursor to `version` if it is higher.
    fn advance(&self, key: &SourceKey, version: u64);
}

/// Concurrent in-memory cursor store. Independent keys never contend beyond
/// the map lock; there is no cross-key coordination to get wrong.
#[derive(Debug, Default)]
pub struct InMemoryPublishedVersionStore {
    cursors: RwLock<HashMap<SourceKey, u64>>,
}

impl InMemoryPublishedVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PublishedVersionStore for InMemoryPublishedVersionStore {
    fn get(&self, key: &SourceKey) -> u64 {
        self.cursors
            .read()
            .map(|cursors| cursors.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn advance(&self, key: &SourceKey, version: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            let entry = cursors.entry(key.clone()).or_insert(0);
            if version > *entry {
                *entry = version;
            }
        }
    }
}

/// Gate decision for one incoming batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// The batch continues the published stream; dispatch it.
    Ready,
    /// A predecessor batch has not been processed yet; requeue for later.
    Awaited { published: u64 },
    /// Already applied; drop silently.
    Obsoleted { published: u64 },
}

/// Version-gated state machine over the published-version cursor.
///
/// Dispatch and cursor advancement for one key are serialized by the
/// partitioned router's single-consumer-per-partition guarantee, not by a
/// lock here: the synchronizer assumes it is never called concurrently for
/// the same key.
pub struct Synchronizer {
    cursors: Arc<dyn PublishedVersionStore>,
}

impl Synchronizer {
    pub fn new(cursors: Arc<dyn PublishedVersionStore>) -> Self {
        Self { cursors }
    }

    pub fn published_version(&self, key: &SourceKey) -> u64 {
        self.cursors.get(key)
    }

    /// Classify a batch against its aggregate's cursor.
    pub fn gate(&self, batch: &VersionedBatch) -> GateDecision {
        let published = self.cursors.get(batch.source_key());
        if batch.start_version() > published + 1 {
            debug!(
                key = %batch.source_key(),
                start = batch.start_version(),
                published,
                "batch awaited: predecessor not yet processed"
            );
            GateDecision::Awaited { published }
        } else if batch.end_version() <= published {
            debug!(
                key = %batch.source_key(),
                end = batch.end_version(),
                published,
                "batch obsoleted: already applied"
            );
            GateDecision::Obsoleted { published }
        } else {
            GateDecision::Ready
        }
    }

    /// Advance the cursor after a successful dispatch.
    pub fn mark_dispatched(&self, batch: &VersionedBatch) {
        self.cursors.advance(batch.source_key(), batch.end_version());
    }
}

/// A message waiting in the retry queue, with its redelivery deadline.
#[derive(Debug)]
pub struct Delayed<M> {
    pub message: M,
    pub attempts: u32,
    due: Instant,
}

/// Bounded queue of messages to re-deliver after a fixed delay.
///
/// The fixed delay means enqueue order and due order coincide, so a plain
/// FIFO suffices. A dedicated consumer sleeps until each message is due and
/// hands it back to `redeliver`.
pub struct RetryQueue<M> {
    queue: Arc<OrderedQueue<Delayed<M>>>,
    delay: Duration,
}

impl<M: Send + 'static> RetryQueue<M> {
    pub fn new(capacity: usize, delay: Duration) -> Self {
        Self {
            queue: Arc::new(OrderedQueue::bounded(capacity)),
            delay,
        }
    }

    /// Queue a message for redelivery. Blocks when the retry queue is full;
    /// back-pressure on a badly gapped stream is intentional.
    pub fn push(&self, message: M, attempts: u32) {
        self.queue.push(Delayed {
            message,
            attempts,
            due: Instant::now() + self.delay,
        });
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Spawn the consumer thread. `redeliver` receives `(message, attempts)`
    /// once the delay has elapsed.
    pub fn spawn_consumer<F>(&self, name: &'static str, redeliver: F) -> WorkerHandle
    where
        F: Fn(M, u32) + Send + 'static,
    {
        let queue = self.queue.clone();
        let tick = Duration::from_millis(250);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }
                    let Some(delayed) = queue.pop_timeout(tick) else {
                        continue;
                    };
                    let now = Instant::now();
                    if delayed.due > now {
                        // Wait on the shutdown channel, not a plain sleep,
                        // so shutdown never blocks for the full delay.
                        match shutdown_rx.recv_timeout(delayed.due - now) {
                            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                            Err(mpsc::RecvTimeoutError::Timeout) => {}
                        }
                    }
                    redeliver(delayed.message, delayed.attempts);
                }
            })
            .expect("failed to spawn retry queue consumer thread");

        WorkerHandle::new(shutdown_tx, join)
    }
}
