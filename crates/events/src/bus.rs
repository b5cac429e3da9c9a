//! Event publishing/subscription boundary (mechanics only).
//!
//! The bus is the **distribution** layer for messages after they have been
//! persisted. It makes minimal assumptions: transport-agnostic, at-least-once
//! delivery, no ordering guarantees of its own (per-aggregate ordering is the
//! partitioned router's job), and no persistence (the event store is the
//! source of truth). Consumers must be idempotent; the handler idempotency
//! ledger is what makes redelivery safe.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

use crate::envelope::MessageEnvelope;

/// A subscription to a message stream.
///
/// Each subscription receives a copy of every message published to the bus
/// (broadcast semantics). Designed for single-threaded consumption: one
/// subscription per consuming thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message. Consumer loops use
    /// this so they can observe shutdown between messages.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Transport-agnostic pub/sub bus.
///
/// `publish` can fail (bus full, transport error). Messages are persisted
/// before they are published, so retrying publication is always safe: the
/// worst case is an extra delivery, which consumers already tolerate.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

/// Envelope publication failed (bus full, transport error, ...).
#[derive(Debug, Error, Clone)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Object-safe publication seam for components that only need to emit
/// envelopes (the unit-of-work, the pipeline's downstream re-publication).
/// Implemented for free by every `EventBus<MessageEnvelope>`.
pub trait EnvelopePublisher: Send + Sync {
    fn publish_envelope(&self, envelope: MessageEnvelope) -> Result<(), PublishError>;
}

impl<B> EnvelopePublisher for B
where
    B: EventBus<MessageEnvelope>,
{
    fn publish_envelope(&self, envelope: MessageEnvelope) -> Result<(), PublishError> {
        self.publish(envelope)
            .map_err(|e| PublishError(format!("{e:?}")))
    }
}
