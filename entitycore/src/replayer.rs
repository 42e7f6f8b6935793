//! Event replayer registration, resolution, and the stream fold.
//!
//! The registry maps an event kind plus an entity's declared type ancestry
//! to the function that applies the event. It is read-mostly: resolution
//! happens on every replayed event, registration only at startup and in
//! tests. Each event kind owns an immutable table behind an `Arc`;
//! registration swaps in a rebuilt table under the owning map shard, so a
//! concurrent resolver observes either the old or the new table, never a
//! partially-updated one, and registrations for different kinds do not
//! contend at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::TryStreamExt;
use tracing::debug;

use crate::entity::{Entity, EntityTypeInfo};
use crate::errors::{CacheResult, ReplayError};
use crate::event::{DomainEvent, EventKind};
use crate::event_log::EventStream;
use crate::types::StreamRevision;

/// The fold state a replay function receives and returns.
///
/// `None` means "no entity yet" (before the first event) or "entity gone"
/// (after a terminal event).
pub type ReplayedEntity = Option<Box<dyn Entity>>;

/// A type-erased replay function: previous fold state plus the next event,
/// producing the new fold state.
pub type BoxedReplayer =
    Arc<dyn Fn(&dyn DomainEvent, ReplayedEntity) -> Result<ReplayedEntity, ReplayError> + Send + Sync>;

/// Proof of a registration, required to deregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationHandle {
    kind: EventKind,
    seq: u64,
}

#[derive(Clone)]
struct Registration {
    entity_type: &'static EntityTypeInfo,
    seq: u64,
    replayer: BoxedReplayer,
}

/// Thread-safe registration table and resolver for event replayers.
///
/// Registrations are additive and keyed by `(event kind, entity type)`;
/// they are only removed by explicit deregistration. Resolution for a
/// fixed registration order is deterministic: ties break toward the first
/// registration.
pub struct ReplayerRegistry {
    tables: DashMap<EventKind, Arc<Vec<Registration>>>,
    next_seq: AtomicU64,
}

impl ReplayerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Registers a type-erased replay function for `kind` against
    /// `entity_type`, returning the handle needed to deregister it.
    pub fn register(
        &self,
        kind: EventKind,
        entity_type: &'static EntityTypeInfo,
        replayer: BoxedReplayer,
    ) -> RegistrationHandle {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            entity_type,
            seq,
            replayer,
        };
        match self.tables.entry(kind) {
            Entry::Occupied(mut occupied) => {
                let mut next: Vec<Registration> = occupied.get().as_ref().clone();
                next.push(registration);
                occupied.insert(Arc::new(next));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(vec![registration]));
            }
        }
        debug!(event = %kind, entity = entity_type.name, "replayer registered");
        RegistrationHandle { kind, seq }
    }

    /// Registers a replay function with a typed event payload.
    ///
    /// The payload is downcast before `apply` runs; a payload of the wrong
    /// runtime type fails the replay with
    /// [`ReplayError::EventTypeMismatch`], which indicates a registration
    /// keyed under the wrong kind.
    pub fn register_event<E, F>(
        &self,
        kind: EventKind,
        entity_type: &'static EntityTypeInfo,
        apply: F,
    ) -> RegistrationHandle
    where
        E: DomainEvent,
        F: Fn(&E, ReplayedEntity) -> Result<ReplayedEntity, ReplayError> + Send + Sync + 'static,
    {
        let replayer: BoxedReplayer = Arc::new(move |event, prior| {
            let typed = event.as_any().downcast_ref::<E>().ok_or_else(|| {
                ReplayError::EventTypeMismatch {
                    expected: kind,
                    actual: event.kind(),
                }
            })?;
            apply(typed, prior)
        });
        self.register(kind, entity_type, replayer)
    }

    /// Removes a registration. Returns whether anything was removed;
    /// deregistering twice is a no-op.
    pub fn deregister(&self, handle: &RegistrationHandle) -> bool {
        if let Entry::Occupied(mut occupied) = self.tables.entry(handle.kind) {
            let before = occupied.get().len();
            let next: Vec<Registration> = occupied
                .get()
                .iter()
                .filter(|r| r.seq != handle.seq)
                .cloned()
                .collect();
            let removed = next.len() < before;
            if next.is_empty() {
                occupied.remove();
            } else {
                occupied.insert(Arc::new(next));
            }
            if removed {
                debug!(event = %handle.kind, "replayer deregistered");
            }
            return removed;
        }
        false
    }

    /// Resolves a replayer for `kind` with no entity in hand, as when
    /// replaying the first event of a stream. If several entity types have
    /// registrations for this kind, the first-registered wins.
    pub fn resolve(&self, kind: EventKind) -> Option<BoxedReplayer> {
        let table = Arc::clone(self.tables.get(&kind)?.value());
        table
            .iter()
            .min_by_key(|r| r.seq)
            .map(|r| Arc::clone(&r.replayer))
    }

    /// Resolves a replayer for `kind` against an entity type, walking the
    /// declared ancestry from most to least derived. A subtype-specific
    /// registration takes precedence over one against a base type.
    pub fn resolve_for(
        &self,
        kind: EventKind,
        entity_type: &'static EntityTypeInfo,
    ) -> Option<BoxedReplayer> {
        let table = Arc::clone(self.tables.get(&kind)?.value());
        for level in entity_type.ancestry() {
            let found = table
                .iter()
                .filter(|r| r.entity_type == level)
                .min_by_key(|r| r.seq);
            if let Some(registration) = found {
                return Some(Arc::clone(&registration.replayer));
            }
        }
        None
    }
}

impl Default for ReplayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayerRegistry")
            .field("event_kinds", &self.tables.len())
            .finish_non_exhaustive()
    }
}

/// Folds a stream of recorded events into an entity, strictly in append
/// order, starting from an absent state.
///
/// Returns the fold result and the revision observed at end of stream
/// ([`StreamRevision::initial`] when the stream yielded no events).
/// Resolution failure for any event is fatal to the whole replay: the log
/// contains an event nobody knows how to apply. Apply errors propagate
/// unmodified.
pub async fn replay_stream(
    registry: &ReplayerRegistry,
    mut events: EventStream,
) -> CacheResult<(ReplayedEntity, StreamRevision)> {
    let mut entity: ReplayedEntity = None;
    let mut revision = StreamRevision::initial();
    while let Some(recorded) = events.try_next().await? {
        let kind = recorded.payload.kind();
        let replayer = match entity.as_deref() {
            Some(current) => registry.resolve_for(kind, current.type_info()),
            None => registry.resolve(kind),
        }
        .ok_or_else(|| ReplayError::ReplayerMissing {
            kind,
            entity_type: entity.as_deref().map(|e| e.type_info().name),
        })?;
        entity = replayer(recorded.payload.as_ref(), entity)?;
        revision = recorded.revision;
    }
    Ok((entity, revision))
}
