//! `eventum-events`: event distribution abstractions.
//!
//! Message envelopes and topics for the external transport contract, the
//! pub/sub bus boundary, and the typed handler registry that dispatch is
//! driven by.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod registry;

pub use bus::{EnvelopePublisher, EventBus, PublishError, Subscription};
pub use envelope::{MessageEnvelope, Topic};
pub use in_memory_bus::InMemoryEventBus;
pub use registry::{HandlerError, HandlerRegistry, Registration, TypeTag};
