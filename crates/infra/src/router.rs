//! Partitioned routing: a fixed set of ordered queues, one consumer each.
//!
//! Per-aggregate ordering is achieved **structurally**: all messages sharing
//! a routing key hash to the same queue, and each queue has exactly one
//! consuming worker, so intra-partition FIFO order holds end to end without
//! a global lock. There is no ordering guarantee across partitions.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::warn;

use eventum_core::fnv1a64;

/// Blocking FIFO queue, optionally bounded.
///
/// A bounded queue blocks the producer when full: explicit back-pressure
/// for the in-process fan-out. Unbounded queues are for paths where an
/// external broker already provides back-pressure.
///
/// Lock poisoning is recovered rather than propagated: a panicked worker
/// must not cost producers their messages, and the queue state is a plain
/// `VecDeque` that stays consistent across a panic.
#[derive(Debug)]
pub struct OrderedQueue<M> {
    items: Mutex<VecDeque<M>>,
    capacity: Option<usize>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<M> OrderedQueue<M> {
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue, blocking while a bounded queue is at capacity.
    pub fn push(&self, message: M) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cap) = self.capacity {
            while items.len() >= cap {
                items = self
                    .not_full
                    .wait(items)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        items.push_back(message);
        self.not_empty.notify_one();
    }

    /// Dequeue, blocking up to `timeout`. `None` on timeout; consumer loops
    /// use the gap to observe shutdown.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<M> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.is_empty() {
            let (guard, result) = self
                .not_empty
                .wait_timeout(items, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            items = guard;
            if result.timed_out() && items.is_empty() {
                return None;
            }
        }
        let message = items.pop_front();
        if message.is_some() {
            self.not_full.notify_one();
        }
        message
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed array of ordered queues with hash routing.
#[derive(Debug)]
pub struct PartitionedRouter<M> {
    queues: Vec<Arc<OrderedQueue<M>>>,
}

impl<M> PartitionedRouter<M> {
    /// `partitions` is clamped to at least 1; `capacity` of `None` means
    /// unbounded queues.
    pub fn new(partitions: usize, capacity: Option<usize>) -> Self {
        let partitions = partitions.max(1);
        let queues = (0..partitions)
            .map(|_| {
                Arc::new(match capacity {
                    Some(cap) => OrderedQueue::bounded(cap),
                    None => OrderedQueue::unbounded(),
                })
            })
            .collect();
        Self { queues }
    }

    /// Default partition count: one per available core.
    pub fn default_partitions() -> usize {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }

    pub fn partitions(&self) -> usize {
        self.queues.len()
    }

    pub fn queue(&self, partition: usize) -> &Arc<OrderedQueue<M>> {
        &self.queues[partition]
    }

    /// Partition selection: single queue when N == 1; least-loaded queue for
    /// an empty key (pure load balancing, no ordering to preserve);
    /// otherwise `hash(key) % N`, which pins every message for one key to
    /// one queue.
    pub fn partition_for(&self, routing_key: &str) -> usize {
        let n = self.queues.len();
        if n == 1 {
            return 0;
        }
        if routing_key.is_empty() {
            return self
                .queues
                .iter()
                .enumerate()
                .min_by_key(|(_, q)| q.len())
                .map(|(idx, _)| idx)
                .unwrap_or(0);
        }
        (fnv1a64(routing_key.as_bytes()) % n as u64) as usize
    }

    /// Route and enqueue. Returns the chosen partition. Blocks when the
    /// target queue is bounded and full.
    pub fn route(&self, routing_key: &str, message: M) -> usize {
        let partition = self.partition_for(routing_key);
        self.queues[partition].push(message);
        partition
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// One consuming worker per partition queue.
pub struct PartitionWorkers {
    handles: Vec<WorkerHandle>,
}

impl PartitionWorkers {
    /// Spawn a named worker thread for every partition of `router`.
    ///
    /// `handler` is invoked as `(partition, message)`; errors are logged at
    /// `warn` and the worker continues. The handler must be idempotent;
    /// at-least-once delivery is the contract upstream.
    pub fn spawn<M, F, E>(name: &'static str, router: &PartitionedRouter<M>, handler: Arc<F>) -> Self
    where
        M: Send + 'static,
        F: Fn(usize, M) -> Result<(), E> + Send + Sync + 'static,
        E: core::fmt::Debug,
    {
        let tick = Duration::from_millis(250);
        let handles = (0..router.partitions())
            .map(|partition| {
                let queue = router.queue(partition).clone();
                let handler = handler.clone();
                let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

                let join = thread::Builder::new()
                    .name(format!("{name}-{partition}"))
                    .spawn(move || {
                        loop {
                            // Cancellation check at the top of every iteration.
                            if shutdown_rx.try_recv().is_ok() {
                                break;
                            }
                            let Some(message) = queue.pop_timeout(tick) else {
                                continue;
                            };
                            if let Err(err) = handler(partition, message) {
                                warn!(worker = name, partition, error = ?err, "partition worker handler failed");
                            }
                        }
                    })
                    .expect("failed to spawn partition worker thread");

                WorkerHandle::new(shutdown_tx, join)
            })
            .collect();

        Self { handles }
    }

    /// Request graceful shutdown of every worker and join them.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_key_always_lands_on_the_same_partition() {
        let router: PartitionedRouter<u32> = PartitionedRouter::new(4, None);
        let first = router.partition_for("order-42");
        for _ in 0..100 {
            assert_eq!(router.partition_for("order-42"), first);
        }
    }

    #[test]
    fn single_partition_takes_everything() {
        let router: PartitionedRouter<u32> = PartitionedRouter::new(1, None);
        assert_eq!(router.partition_for(""), 0);
        assert_eq!(router.partition_for("anything"), 0);
    }

    #[test]
    fn empty_key_picks_the_least_loaded_queue() {
        let router: PartitionedRouter<u32> = PartitionedRouter::new(3, None);
        router.queue(0).push(1);
        router.queue(0).push(2);
        router.queue(1).push(3);
        // Queue 2 is empty and must win.
        assert_eq!(router.partition_for(""), 2);
    }

    #[test]
    fn bounded_queue_applies_back_pressure() {
        let queue = Arc::new(OrderedQueue::<u32>::bounded(1));
        queue.push(1);

        let q = queue.clone();
        let producer = thread::spawn(move || {
            // Blocks until the consumer pops.
            q.push(2);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        assert_eq!(queue.pop_timeout(Duration::from_secs(1)), Some(1));
        producer.join().unwrap();
        assert_eq!(queue.pop_timeout(Duration::from_secs(1)), Some(2));
    }

    #[test]
    fn poisoned_lock_does_not_lose_messages() {
        let queue = Arc::new(OrderedQueue::<u32>::unbounded());

        // Panic while holding the lock to poison it.
        let q = queue.clone();
        let _ = thread::spawn(move || {
            let _guard = q.items.lock().unwrap();
            panic!("poison the queue lock");
        })
        .join();

        queue.push(7);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), Some(7));
    }

    #[test]
    fn pop_timeout_returns_none_when_idle() {
        let queue = OrderedQueue::<u32>::unbounded();
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn workers_preserve_fifo_within_a_partition() {
        let router: PartitionedRouter<(String, u64)> = PartitionedRouter::new(2, None);
        let seen: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();

        let workers = PartitionWorkers::spawn(
            "test-worker",
            &router,
            Arc::new(move |_, msg: (String, u64)| {
                seen_in_handler.lock().unwrap().push(msg);
                Ok::<(), String>(())
            }),
        );

        for v in 1..=20u64 {
            router.route("order-42", ("order-42".to_string(), v));
            router.route(&format!("other-{v}"), (format!("other-{v}"), v));
        }

        // Wait for the workers to drain both queues.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() < 40 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        workers.shutdown();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 40);
        let order42: Vec<u64> = seen
            .iter()
            .filter(|(k, _)| k == "order-42")
            .map(|(_, v)| *v)
            .collect();
        // Per-key order survives interleaving with unrelated keys.
        assert_eq!(order42, (1..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn shutdown_stops_workers() {
        let router: PartitionedRouter<u32> = PartitionedRouter::new(2, None);
        let count = Arc::new(AtomicUsize::new(0));
        let count_in_handler = count.clone();
        let workers = PartitionWorkers::spawn(
            "stop-test",
            &router,
            Arc::new(move |_, _msg: u32| {
                count_in_handler.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }),
        );
        router.route("k", 1);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        workers.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
