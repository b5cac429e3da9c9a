//! Typed handler registry.
//!
//! Dispatch is driven by **static registration**: a message-type tag (or a
//! tuple of tags, for handlers that consume several event types of one
//! batch) maps to a closure, built once at startup. There are no ambient
//! statics and no runtime type scanning; the registry is constructed
//! explicitly and passed by reference to the pipeline.

use thiserror::Error;

use eventum_core::{EventPayload, TypeCode, VersionedBatch};

/// Name-based tag of an event or handler type, with its derived code.
///
/// The code is a fast pre-filter; matching always confirms on the canonical
/// names, so a code collision can never route a batch to the wrong handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeTag {
    namespace: String,
    type_name: String,
    code: TypeCode,
}

impl TypeTag {
    pub fn new(namespace: impl Into<String>, type_name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let type_name = type_name.into();
        let code = TypeCode::of(&namespace, &type_name);
        Self {
            namespace,
            type_name,
            code,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn code(&self) -> TypeCode {
        self.code
    }

    fn matches_payload(&self, payload: &EventPayload) -> bool {
        self.code == payload.type_code()
            && self.namespace == payload.namespace
            && self.type_name == payload.type_name
    }
}

impl core::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.type_name)
    }
}

/// Handler invocation failure.
#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    /// Infrastructure hiccup; the pipeline retries a bounded number of
    /// times with a fixed delay before giving up.
    #[error("transient handler failure: {0}")]
    Transient(String),

    /// Deterministic failure; retrying cannot help.
    #[error("handler failed: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

type HandlerFn = Box<dyn Fn(u64, &[EventPayload]) -> Result<(), HandlerError> + Send + Sync>;

/// One registered handler: its identity tag (for the idempotency ledger),
/// the set of event type tags it consumes, and the closure to invoke.
pub struct Registration {
    handler: TypeTag,
    consumes: Vec<TypeTag>,
    f: HandlerFn,
}

impl Registration {
    pub fn handler(&self) -> &TypeTag {
        &self.handler
    }

    pub fn consumes(&self) -> &[TypeTag] {
        &self.consumes
    }

    /// A registration fires when every tag it consumes appears among the
    /// batch's payload types (single-event handlers are the 1-element case).
    fn matches(&self, batch: &VersionedBatch) -> bool {
        self.consumes
            .iter()
            .all(|tag| batch.payloads().iter().any(|p| tag.matches_payload(p)))
    }

    /// Invoke with the batch's end version and the payloads, in list order.
    pub fn invoke(&self, version: u64, payloads: &[EventPayload]) -> Result<(), HandlerError> {
        (self.f)(version, payloads)
    }
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("handler", &self.handler)
            .field("consumes", &self.consumes)
            .finish_non_exhaustive()
    }
}

/// Immutable handler registry, built once at startup.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    registrations: Vec<Registration>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Registrations whose consumed tag set is covered by the batch.
    pub fn resolve(&self, batch: &VersionedBatch) -> Vec<&Registration> {
        self.registrations
            .iter()
            .filter(|r| r.matches(batch))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    registrations: Vec<Registration>,
}

impl HandlerRegistryBuilder {
    /// Register a handler for a set of event types.
    pub fn register<F>(mut self, handler: TypeTag, consumes: Vec<TypeTag>, f: F) -> Self
    where
        F: Fn(u64, &[EventPayload]) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let mut consumes = consumes;
        consumes.sort_by_key(|t| t.code());
        consumes.dedup();
        self.registrations.push(Registration {
            handler,
            consumes,
            f: Box::new(f),
        });
        self
    }

    /// Convenience for the common single-event-type handler.
    pub fn register_single<F>(self, handler: TypeTag, consumes: TypeTag, f: F) -> Self
    where
        F: Fn(u64, &[EventPayload]) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(handler, vec![consumes], f)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            registrations: self.registrations,
        }
    }
}
