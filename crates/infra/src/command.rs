//! Command unit-of-work.
//!
//! A [`CommandContext`] tracks every entity a command handler touches, and
//! [`CommandContext::commit`] persists and publishes in one deterministic
//! order: invariant check, event-sourced saves, plain-entity saves, queued
//! integration events, command result. At most one entity may change per
//! command; a handler that needs to affect several aggregates must do so
//! through events consumed by downstream handlers.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, warn};

use eventum_core::{CoreError, CorrelationId, MessageId, SourceKey};
use eventum_events::{EnvelopePublisher, MessageEnvelope, PublishError, Topic};

use crate::aggregate_store::{AggregateStore, AggregateStoreError, Persistable, SaveOutcome};

/// A non-event-sourced entity stored by current state only: lookup data,
/// configuration, projections. No versioning, no replay, no pending events.
pub trait PlainEntity: Clone + Send + Serialize + DeserializeOwned + 'static {
    const NAMESPACE: &'static str;
    const TYPE_NAME: &'static str;
    const QUALIFIER: &'static str;

    fn source_id(&self) -> &str;

    fn source_key(&self) -> SourceKey {
        SourceKey::new(
            Self::NAMESPACE,
            Self::TYPE_NAME,
            Self::QUALIFIER,
            self.source_id(),
        )
    }
}

#[derive(Debug, Error)]
pub enum PlainStoreError {
    #[error("plain store failure: {0}")]
    Storage(String),
}

/// State-based repository for one plain entity type.
pub trait PlainRepository<P: PlainEntity>: Send + Sync {
    fn find(&self, source_id: &str) -> Result<Option<P>, PlainStoreError>;
    fn save(&self, entity: &P) -> Result<(), PlainStoreError>;
    fn delete(&self, source_id: &str) -> Result<(), PlainStoreError>;
}

/// In-memory plain repository.
#[derive(Debug)]
pub struct InMemoryPlainRepository<P> {
    entities: RwLock<HashMap<String, P>>,
}

impl<P> Default for InMemoryPlainRepository<P> {
    fn default() -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
        }
    }
}

impl<P> InMemoryPlainRepository<P> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P: PlainEntity + Sync> PlainRepository<P> for InMemoryPlainRepository<P> {
    fn find(&self, source_id: &str) -> Result<Option<P>, PlainStoreError> {
        let entities = self
            .entities
            .read()
            .map_err(|_| PlainStoreError::Storage("lock poisoned".to_string()))?;
        Ok(entities.get(source_id).cloned())
    }

    fn save(&self, entity: &P) -> Result<(), PlainStoreError> {
        let mut entities = self
            .entities
            .write()
            .map_err(|_| PlainStoreError::Storage("lock poisoned".to_string()))?;
        entities.insert(entity.source_id().to_string(), entity.clone());
        Ok(())
    }

    fn delete(&self, source_id: &str) -> Result<(), PlainStoreError> {
        let mut entities = self
            .entities
            .write()
            .map_err(|_| PlainStoreError::Storage("lock poisoned".to_string()))?;
        entities.remove(source_id);
        Ok(())
    }
}

/// Type-indexed registry of aggregate stores and plain repositories, built
/// once at startup and shared by every command context.
#[derive(Default)]
pub struct StoreRegistry {
    aggregates: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    plains: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_aggregate<A>(&mut self, store: Arc<AggregateStore<A>>)
    where
        A: Persistable + Sync,
    {
        self.aggregates.insert(TypeId::of::<A>(), Box::new(store));
    }

    pub fn register_plain<P>(&mut self, repository: Arc<dyn PlainRepository<P>>)
    where
        P: PlainEntity + Sync,
    {
        self.plains.insert(TypeId::of::<P>(), Box::new(repository));
    }

    pub fn aggregate_store<A>(&self) -> Result<Arc<AggregateStore<A>>, CoreError>
    where
        A: Persistable + Sync,
    {
        self.aggregates
            .get(&TypeId::of::<A>())
            .and_then(|b| b.downcast_ref::<Arc<AggregateStore<A>>>())
            .cloned()
            .ok_or_else(|| {
                CoreError::UnknownAggregateType(format!("{}.{}", A::NAMESPACE, A::TYPE_NAME))
            })
    }

    pub fn plain_repository<P>(&self) -> Result<Arc<dyn PlainRepository<P>>, CoreError>
    where
        P: PlainEntity + Sync,
    {
        self.plains
            .get(&TypeId::of::<P>())
            .and_then(|b| b.downcast_ref::<Arc<dyn PlainRepository<P>>>())
            .cloned()
            .ok_or_else(|| {
                CoreError::UnknownAggregateType(format!("{}.{}", P::NAMESPACE, P::TYPE_NAME))
            })
    }
}

/// Terminal state of one command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// State changed and is durable.
    Succeeded,
    /// The command was valid but produced no state change (including an
    /// idempotent replay whose events were already persisted).
    NothingChanged,
    /// The command was rejected or failed; no state changed.
    Failed(String),
}

/// Completion notification for one command, published on the
/// `CommandResults` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: CorrelationId,
    pub status: CommandStatus,
    pub source_key: Option<SourceKey>,
    pub version: Option<u64>,
}

impl CommandResult {
    pub fn succeeded(command_id: CorrelationId, source_key: SourceKey, version: u64) -> Self {
        Self {
            command_id,
            status: CommandStatus::Succeeded,
            source_key: Some(source_key),
            version: Some(version),
        }
    }

    pub fn nothing_changed(command_id: CorrelationId) -> Self {
        Self {
            command_id,
            status: CommandStatus::NothingChanged,
            source_key: None,
            version: None,
        }
    }

    pub fn failed(command_id: CorrelationId, reason: impl Into<String>) -> Self {
        Self {
            command_id,
            status: CommandStatus::Failed(reason.into()),
            source_key: None,
            version: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Aggregate(#[from] AggregateStoreError),

    #[error(transparent)]
    Plain(#[from] PlainStoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("event serialization failed: {0}")]
    Serialize(String),

    /// Two distinct entity types registered under one source key. Signals a
    /// namespace/type-name clash in the domain model.
    #[error("tracked entity type mismatch for {key}")]
    TrackedTypeMismatch { key: String },
}

enum PersistOutcome {
    Unchanged,
    Saved {
        source_key: Option<SourceKey>,
        version: Option<u64>,
    },
}

/// One entity the context has handed out, type-erased so the context can
/// hold a mixed working set.
trait TrackedEntry {
    fn is_dirty(&self) -> bool;
    fn persist(&mut self, correlation: CorrelationId) -> Result<PersistOutcome, ContextError>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct TrackedAggregate<A: Persistable + Sync> {
    aggregate: A,
    store: Arc<AggregateStore<A>>,
}

impl<A: Persistable + Sync> TrackedEntry for TrackedAggregate<A> {
    fn is_dirty(&self) -> bool {
        !self.aggregate.pending().is_empty()
    }

    fn persist(&mut self, correlation: CorrelationId) -> Result<PersistOutcome, ContextError> {
        match self.store.save(&mut self.aggregate, Some(correlation))? {
            SaveOutcome::Saved(batch) => Ok(PersistOutcome::Saved {
                source_key: Some(batch.source_key().clone()),
                version: Some(batch.end_version()),
            }),
            SaveOutcome::NothingToSave => Ok(PersistOutcome::Unchanged),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct TrackedPlain<P: PlainEntity + Sync> {
    source_id: String,
    /// `None` marks a pending deletion.
    entity: Option<P>,
    dirty: bool,
    repository: Arc<dyn PlainRepository<P>>,
}

impl<P: PlainEntity + Sync> TrackedEntry for TrackedPlain<P> {
    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn persist(&mut self, _correlation: CorrelationId) -> Result<PersistOutcome, ContextError> {
        if !self.dirty {
            return Ok(PersistOutcome::Unchanged);
        }
        match &self.entity {
            Some(entity) => self.repository.save(entity)?,
            None => self.repository.delete(&self.source_id)?,
        }
        self.dirty = false;
        Ok(PersistOutcome::Saved {
            source_key: None,
            version: None,
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Unit-of-work for one command execution. Single-threaded by construction:
/// a context belongs to the command handler that created it and is consumed
/// by [`CommandContext::commit`].
pub struct CommandContext {
    registry: Arc<StoreRegistry>,
    publisher: Arc<dyn EnvelopePublisher>,
    command_id: CorrelationId,
    tracked: HashMap<SourceKey, Box<dyn TrackedEntry>>,
    queued: Vec<MessageEnvelope>,
}

impl CommandContext {
    pub fn new(
        registry: Arc<StoreRegistry>,
        publisher: Arc<dyn EnvelopePublisher>,
        command_id: CorrelationId,
    ) -> Self {
        Self {
            registry,
            publisher,
            command_id,
            tracked: HashMap::new(),
            queued: Vec::new(),
        }
    }

    pub fn command_id(&self) -> CorrelationId {
        self.command_id
    }

    /// Borrow an event-sourced aggregate, loading it on first access. A
    /// never-persisted id yields a fresh instance at version 0, so creation
    /// and mutation are the same code path for callers.
    pub fn get<A>(&mut self, source_id: &str) -> Result<&mut A, ContextError>
    where
        A: Persistable + Sync,
    {
        let key = SourceKey::new(A::NAMESPACE, A::TYPE_NAME, A::QUALIFIER, source_id);
        let entry = match self.tracked.entry(key.clone()) {
            std::collections::hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
            std::collections::hash_map::Entry::Vacant(vacant) => {
                let store = self.registry.aggregate_store::<A>()?;
                let aggregate = store.find(source_id)?;
                vacant.insert(Box::new(TrackedAggregate { aggregate, store }))
            }
        };
        entry
            .as_any_mut()
            .downcast_mut::<TrackedAggregate<A>>()
            .map(|tracked| &mut tracked.aggregate)
            .ok_or(ContextError::TrackedTypeMismatch {
                key: key.to_string(),
            })
    }

    /// Borrow a plain entity if it exists. The borrowed entity is marked
    /// dirty and will be saved on commit.
    pub fn get_plain<P>(&mut self, source_id: &str) -> Result<Option<&mut P>, ContextError>
    where
        P: PlainEntity + Sync,
    {
        let key = SourceKey::new(P::NAMESPACE, P::TYPE_NAME, P::QUALIFIER, source_id);
        if !self.tracked.contains_key(&key) {
            let repository = self.registry.plain_repository::<P>()?;
            let Some(entity) = repository.find(source_id)? else {
                return Ok(None);
            };
            self.tracked.insert(
                key.clone(),
                Box::new(TrackedPlain {
                    source_id: source_id.to_string(),
                    entity: Some(entity),
                    dirty: false,
                    repository,
                }),
            );
        }
        let Some(entry) = self.tracked.get_mut(&key) else {
            return Ok(None);
        };
        let tracked = entry
            .as_any_mut()
            .downcast_mut::<TrackedPlain<P>>()
            .ok_or(ContextError::TrackedTypeMismatch {
                key: key.to_string(),
            })?;
        tracked.dirty = true;
        Ok(tracked.entity.as_mut())
    }

    /// Insert or replace a plain entity; saved on commit.
    pub fn put_plain<P>(&mut self, entity: P) -> Result<(), ContextError>
    where
        P: PlainEntity + Sync,
    {
        let key = entity.source_key();
        let repository = self.registry.plain_repository::<P>()?;
        self.tracked.insert(
            key,
            Box::new(TrackedPlain {
                source_id: entity.source_id().to_string(),
                entity: Some(entity),
                dirty: true,
                repository,
            }),
        );
        Ok(())
    }

    /// Mark a plain entity for deletion on commit.
    pub fn delete_plain<P>(&mut self, source_id: &str) -> Result<(), ContextError>
    where
        P: PlainEntity + Sync,
    {
        let key = SourceKey::new(P::NAMESPACE, P::TYPE_NAME, P::QUALIFIER, source_id);
        let repository = self.registry.plain_repository::<P>()?;
        self.tracked.insert(
            key,
            Box::new(TrackedPlain::<P> {
                source_id: source_id.to_string(),
                entity: None,
                dirty: true,
                repository,
            }),
        );
        Ok(())
    }

    /// Queue an integration event for publication on the `Events` topic.
    /// Nothing leaves the context before commit, and commit publishes only
    /// after persistence succeeded.
    pub fn queue_event<E: Serialize>(
        &mut self,
        namespace: &str,
        type_name: &str,
        routing_key: &str,
        event: &E,
    ) -> Result<(), ContextError> {
        let payload =
            serde_json::to_value(event).map_err(|e| ContextError::Serialize(e.to_string()))?;
        self.queued.push(MessageEnvelope::new(
            MessageId::new(),
            Topic::Events,
            routing_key,
            "eventum",
            namespace,
            type_name,
            payload,
        ));
        Ok(())
    }

    /// Persist the working set, publish queued events, and notify the
    /// command's outcome on the `CommandResults` topic.
    ///
    /// Order: invariant check first (nothing persists if it fails), then
    /// saves, then queued integration events, then the result notification.
    /// A failure mid-sequence leaves earlier saves durable and is notified
    /// as a `Failed` result; clients decide from the result whether to
    /// retry. State is durable before the result goes out, so a lost
    /// notification degrades to a client-side timeout, never to a phantom
    /// success.
    pub fn commit(mut self) -> Result<CommandResult, ContextError> {
        let outcome = self.persist_and_publish();
        let result = match &outcome {
            Ok(result) => result.clone(),
            Err(e) => CommandResult::failed(self.command_id, e.to_string()),
        };
        if let Err(e) = publish_command_result(self.publisher.as_ref(), &result) {
            warn!(command = %self.command_id, error = %e, "command result notification failed");
        }
        debug!(command = %self.command_id, status = ?result.status, "command committed");
        outcome
    }

    fn persist_and_publish(&mut self) -> Result<CommandResult, ContextError> {
        let dirty = self
            .tracked
            .values()
            .filter(|entry| entry.is_dirty())
            .count();
        if dirty > 1 {
            return Err(CoreError::MultipleAggregatesChanged {
                correlation: self.command_id.to_string(),
                count: dirty,
            }
            .into());
        }

        let mut aggregate_result: Option<(SourceKey, u64)> = None;
        let mut anything_changed = false;
        for entry in self.tracked.values_mut() {
            match entry.persist(self.command_id)? {
                PersistOutcome::Unchanged => {}
                PersistOutcome::Saved {
                    source_key,
                    version,
                } => {
                    anything_changed = true;
                    if let (Some(key), Some(version)) = (source_key, version) {
                        aggregate_result = Some((key, version));
                    }
                }
            }
        }

        for envelope in self.queued.drain(..) {
            self.publisher.publish_envelope(envelope)?;
        }

        Ok(match aggregate_result {
            Some((source_key, version)) => {
                CommandResult::succeeded(self.command_id, source_key, version)
            }
            None if anything_changed => CommandResult {
                command_id: self.command_id,
                status: CommandStatus::Succeeded,
                source_key: None,
                version: None,
            },
            None => CommandResult::nothing_changed(self.command_id),
        })
    }
}

/// Publish a command result on the `CommandResults` topic. Routing key is
/// the changed aggregate's id when one exists, else the command id, so
/// results for one aggregate stay ordered.
pub fn publish_command_result(
    publisher: &dyn EnvelopePublisher,
    result: &CommandResult,
) -> Result<(), PublishError> {
    let routing_key = result
        .source_key
        .as_ref()
        .map(|key| key.source_id().to_string())
        .unwrap_or_else(|| result.command_id.to_string());
    let payload = serde_json::to_value(result)
        .map_err(|e| PublishError(format!("command result serialization failed: {e}")))?;
    publisher.publish_envelope(
        MessageEnvelope::new(
            MessageId::new(),
            Topic::CommandResults,
            routing_key,
            "eventum",
            "eventum",
            "CommandResult",
            payload,
        )
        .with_metadata("command_id", result.command_id.to_string()),
    )
}
