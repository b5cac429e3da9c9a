//! In-memory topic bus for tests and single-process deployments.

use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, Subscription};
use crate::envelope::{MessageEnvelope, Topic};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

type Filter<M> = Box<dyn Fn(&M) -> bool + Send + Sync>;

/// One attached subscriber: its channel plus an optional delivery filter.
/// A filtered tap only ever sees messages its predicate accepts.
struct Tap<M> {
    sender: mpsc::Sender<M>,
    filter: Option<Filter<M>>,
}

impl<M> Tap<M> {
    fn wants(&self, message: &M) -> bool {
        self.filter.as_ref().map(|accepts| accepts(message)).unwrap_or(true)
    }
}

/// In-memory pub/sub bus.
///
/// - No IO / no async
/// - Best-effort fan-out; a consumer that dropped its subscription is
///   pruned on the next matching publish
/// - At-least-once acceptable (subscribers must be idempotent)
pub struct InMemoryEventBus<M> {
    taps: Mutex<Vec<Tap<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with a delivery predicate. Messages the predicate rejects
    /// are never sent to this subscription.
    pub fn subscribe_filtered<F>(&self, filter: F) -> Subscription<M>
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.attach(Some(Box::new(filter)))
    }

    fn attach(&self, filter: Option<Filter<M>>) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut taps) = self.taps.lock() {
            taps.push(Tap { sender: tx, filter });
        }

        Subscription::new(rx)
    }
}

impl InMemoryEventBus<MessageEnvelope> {
    /// Subscription restricted to one topic. Consumers of a single topic
    /// (command-result listeners, downstream batch consumers) use this
    /// instead of discarding unrelated envelopes themselves.
    pub fn subscribe_topic(&self, topic: Topic) -> Subscription<MessageEnvelope> {
        self.subscribe_filtered(move |envelope| envelope.topic() == topic)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            taps: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut taps = self.taps.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        taps.retain(|tap| !tap.wants(&message) || tap.sender.send(message.clone()).is_ok());

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        self.attach(None)
    }
}
