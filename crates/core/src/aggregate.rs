//! The event-sourced aggregate contract and batch replay.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{CoreError, CoreResult};
use crate::event::{EventPayload, VersionedBatch};
use crate::source::SourceKey;

/// Append-only buffer of events raised by an aggregate since its last
/// persist. Cleared by the aggregate store on successful save.
///
/// Serde derives exist so aggregates can `#[derive(Serialize, Deserialize)]`
/// for snapshotting; snapshots are taken after the buffer is drained, so a
/// persisted buffer is always empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingEvents<E> {
    events: Vec<E>,
}

impl<E> PendingEvents<E> {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: E) {
        self.events.push(event);
    }

    pub fn as_slice(&self) -> &[E] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn drain(&mut self) -> Vec<E> {
        std::mem::take(&mut self.events)
    }
}

/// Event-sourced aggregate root.
///
/// Lifecycle:
/// - Constructed via [`EventSourced::with_id`] at version 0 when no snapshot
///   or events exist.
/// - Rehydrated by [`replay`], which applies stored batches in ascending
///   version order and fails fast on any gap or overlap.
/// - Mutated by command handlers, which call [`EventSourced::record`] with
///   new events; `apply` evolves in-memory state for each recorded event.
/// - Persisted by the aggregate store, which drains the pending buffer and
///   advances the version to the batch's end version.
///
/// `apply` must be pure and deterministic: same events, same state. It must
/// **not** touch the version; version movement belongs to persistence and
/// replay, which is what lets a duplicate save be detected instead of
/// silently double-advancing.
pub trait EventSourced: Sized + Send {
    /// Typed domain event for this aggregate.
    type Event: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Logical namespace of the aggregate type (e.g. "orders").
    const NAMESPACE: &'static str;
    /// Type name of the aggregate (e.g. "Order").
    const TYPE_NAME: &'static str;
    /// Deployment qualifier carried in persisted records (e.g. the crate name).
    const QUALIFIER: &'static str;

    /// Construct a fresh instance at version 0.
    fn with_id(source_id: &str) -> Self;

    fn source_id(&self) -> &str;

    /// Persisted version. Starts at 0; moved only by persistence and replay.
    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    /// Evolve in-memory state from a single event. Pure; no version changes.
    fn apply(&mut self, event: &Self::Event);

    /// Canonical name of one event, carried in persisted payloads so
    /// handlers can subscribe per event type rather than per aggregate.
    fn event_type_name(event: &Self::Event) -> &'static str;

    fn pending(&self) -> &PendingEvents<Self::Event>;

    fn pending_mut(&mut self) -> &mut PendingEvents<Self::Event>;

    /// Raise a new event: apply it to in-memory state and buffer it for the
    /// next persist.
    fn record(&mut self, event: Self::Event) {
        self.apply(&event);
        self.pending_mut().record(event);
    }

    /// Identity of this instance.
    fn source_key(&self) -> SourceKey {
        SourceKey::new(
            Self::NAMESPACE,
            Self::TYPE_NAME,
            Self::QUALIFIER,
            self.source_id(),
        )
    }

    /// Serialize pending events into batch payload items, in raise order.
    fn pending_payloads(&self) -> CoreResult<Vec<EventPayload>> {
        self.pending()
            .as_slice()
            .iter()
            .enumerate()
            .map(|(idx, ev)| {
                EventPayload::from_typed(
                    idx as u32,
                    Self::QUALIFIER,
                    Self::NAMESPACE,
                    Self::event_type_name(ev),
                    ev,
                )
            })
            .collect()
    }
}

/// Apply stored batches to an aggregate in ascending version order.
///
/// Each batch must start exactly at `aggregate.version() + 1`; a gap or an
/// overlap means the stored stream is corrupt and replay fails fast rather
/// than skipping. After a batch is applied (payloads in list order) the
/// version becomes the batch's end version.
pub fn replay<A>(aggregate: &mut A, batches: &[VersionedBatch]) -> CoreResult<()>
where
    A: EventSourced,
{
    for batch in batches {
        let expected = aggregate.version() + 1;
        if batch.start_version() != expected {
            return Err(CoreError::VersionGap {
                key: batch.source_key().to_string(),
                expected,
                found: batch.start_version(),
            });
        }
        for payload in batch.payloads() {
            let event: A::Event = payload.to_typed()?;
            aggregate.apply(&event);
        }
        aggregate.set_version(batch.end_version());
    }
    Ok(())
}
