//! The per-transaction entity store: identity map, change tracking, and
//! the optimistic save path.
//!
//! One `EntityStore` represents one business transaction. It is a
//! single-owner, sequential unit of work - deliberately not shareable
//! between callers - layered over the shared [`EntityCache`] and the
//! external [`EventLog`]. Repeat reads within the transaction come from
//! the identity map without touching the cache; the first read of a
//! stream checks an instance out of the cache (which replays from the log
//! on a miss). Saving appends all recorded events in one atomic,
//! revision-conditioned log call and never retries or merges on conflict.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::cache::{CheckoutOrigin, EntityCache};
use crate::entity::Entity;
use crate::errors::{EntityStoreError, EntityStoreResult};
use crate::event_log::{EventLog, EventToAppend};
use crate::tracking::{TrackingState, Transition};
use crate::types::{StreamId, StreamRevision};

/// Where a tracked entity instance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provenance {
    /// Taken from the shared cache's loan slot.
    LoanedFromCache {
        /// Revision the instance was checked out at.
        revision: StreamRevision,
    },
    /// Reconstructed by a fresh fold over the log.
    ReplayedFresh {
        /// Revision observed at end of stream.
        revision: StreamRevision,
    },
    /// Created inside this transaction; nothing committed yet.
    Created,
    /// Saved by this transaction. The resulting per-stream revision may be
    /// ambiguous after a multi-stream commit, so the instance is dropped
    /// at disposal instead of returned to the cache.
    Committed,
}

impl Provenance {
    fn checkout_revision(self) -> Option<StreamRevision> {
        match self {
            Self::LoanedFromCache { revision } | Self::ReplayedFresh { revision } => Some(revision),
            Self::Created | Self::Committed => None,
        }
    }
}

struct Tracked {
    entity: Box<dyn Entity>,
    state: TrackingState,
    provenance: Provenance,
    /// Position of this entity's first tracked mutation; save appends
    /// events in this order.
    order: u64,
}

/// Identity map and change tracker for one business transaction.
///
/// Dropping the store (or calling [`EntityStore::dispose`]) discards the
/// transaction without committing: clean checked-out instances go back to
/// the cache, everything else is dropped. Ownership makes use after
/// disposal unrepresentable.
pub struct EntityStore {
    log: Arc<dyn EventLog>,
    cache: Arc<EntityCache>,
    identity: HashMap<StreamId, Tracked>,
    op_seq: u64,
}

impl EntityStore {
    /// Creates a store for one transaction over the given collaborators.
    pub fn new(log: Arc<dyn EventLog>, cache: Arc<EntityCache>) -> Self {
        Self {
            log,
            cache,
            identity: HashMap::new(),
            op_seq: 0,
        }
    }

    /// Loads the entity for `stream_id` as concrete type `T`.
    ///
    /// Consults the transaction's identity map first; on a miss, checks an
    /// instance out of the shared cache (which replays from the log if
    /// needed). Returns `Ok(None)` when the stream has no surviving entity
    /// or when the reconstructed entity is not a `T` - "not found as the
    /// requested type" is a normal result, not an error. An instance
    /// rejected for its type is handed straight back to the cache.
    pub async fn get_by_id<T: Entity>(
        &mut self,
        stream_id: &StreamId,
    ) -> EntityStoreResult<Option<&mut T>> {
        if !self.identity.contains_key(stream_id) {
            let checkout = self.cache.checkout(stream_id).await?;
            let revision = checkout.revision;
            match checkout.entity {
                Some(entity) => {
                    if entity.as_any().downcast_ref::<T>().is_none() {
                        debug!(
                            stream = %stream_id,
                            actual = entity.type_info().name,
                            "reconstructed entity is not the requested type"
                        );
                        self.cache.release(stream_id, revision, entity);
                        return Ok(None);
                    }
                    let provenance = match checkout.origin {
                        CheckoutOrigin::Pool => Provenance::LoanedFromCache { revision },
                        CheckoutOrigin::Replayed => Provenance::ReplayedFresh { revision },
                    };
                    self.identity.insert(
                        stream_id.clone(),
                        Tracked {
                            entity,
                            state: TrackingState::Untracked,
                            provenance,
                            order: 0,
                        },
                    );
                }
                None => return Ok(None),
            }
        }
        Ok(self
            .identity
            .get_mut(stream_id)
            .and_then(|tracked| tracked.entity.as_any_mut().downcast_mut::<T>()))
    }

    /// Tracks `entity` as newly created (or re-added per the transition
    /// table). The entity's own stream id keys the identity map.
    ///
    /// Adding is idempotent for an already-created entity and illegal for
    /// an updated one: a deleted entity must not be silently resurrected
    /// as new. Re-adding a deleted entity downgrades the deletion to an
    /// update, since the entity still exists in the log.
    pub fn add<T: Entity>(&mut self, entity: T) -> EntityStoreResult<()> {
        let stream_id = entity.stream_id().clone();
        if let Some(tracked) = self.identity.get_mut(&stream_id) {
            return match tracked.state.on_add() {
                Transition::Set(next) => {
                    if tracked.state == TrackingState::Untracked {
                        tracked.order = Self::bump(&mut self.op_seq);
                    }
                    tracked.state = next;
                    tracked.entity = Box::new(entity);
                    Ok(())
                }
                Transition::Noop => Ok(()),
                Transition::Forget => {
                    self.identity.remove(&stream_id);
                    Ok(())
                }
                Transition::Illegal => Err(EntityStoreError::IllegalTransition {
                    operation: "add",
                    state: tracked.state,
                }),
            };
        }
        let order = Self::bump(&mut self.op_seq);
        self.identity.insert(
            stream_id,
            Tracked {
                entity: Box::new(entity),
                state: TrackingState::Created,
                provenance: Provenance::Created,
                order,
            },
        );
        Ok(())
    }

    /// Marks the tracked entity for `stream_id` as updated.
    pub fn update(&mut self, stream_id: &StreamId) -> EntityStoreResult<()> {
        let op_seq = &mut self.op_seq;
        let tracked =
            self.identity
                .get_mut(stream_id)
                .ok_or_else(|| EntityStoreError::NotTracked {
                    stream: stream_id.clone(),
                })?;
        match tracked.state.on_update() {
            Transition::Set(next) => {
                if tracked.state == TrackingState::Untracked {
                    tracked.order = Self::bump(op_seq);
                }
                tracked.state = next;
                Ok(())
            }
            Transition::Noop => Ok(()),
            Transition::Forget => {
                self.identity.remove(stream_id);
                Ok(())
            }
            Transition::Illegal => Err(EntityStoreError::IllegalTransition {
                operation: "update",
                state: tracked.state,
            }),
        }
    }

    /// Marks the tracked entity for `stream_id` as deleted.
    ///
    /// Removing a not-yet-committed creation simply forgets it - there is
    /// nothing in the log to roll back. Removing an updated entity turns
    /// the pending update into a pending deletion.
    pub fn remove(&mut self, stream_id: &StreamId) -> EntityStoreResult<()> {
        let op_seq = &mut self.op_seq;
        let tracked =
            self.identity
                .get_mut(stream_id)
                .ok_or_else(|| EntityStoreError::NotTracked {
                    stream: stream_id.clone(),
                })?;
        match tracked.state.on_remove() {
            Transition::Set(next) => {
                if tracked.state == TrackingState::Untracked {
                    tracked.order = Self::bump(op_seq);
                }
                tracked.state = next;
                Ok(())
            }
            Transition::Noop => Ok(()),
            Transition::Forget => {
                self.identity.remove(stream_id);
                Ok(())
            }
            Transition::Illegal => Err(EntityStoreError::IllegalTransition {
                operation: "remove",
                state: tracked.state,
            }),
        }
    }

    /// Forgets all tracked changes without committing anything.
    ///
    /// Mutated instances are dropped (their in-memory state has diverged
    /// from the log); clean checked-out instances stay usable in this
    /// transaction and return to the cache at disposal.
    pub fn discard_changes(&mut self) {
        let before = self.identity.len();
        self.identity
            .retain(|_, tracked| tracked.state == TrackingState::Untracked);
        debug!(dropped = before - self.identity.len(), "changes discarded");
    }

    /// Appends all recorded events to the log with optimistic concurrency.
    ///
    /// Events are collected per entity in the order mutations were first
    /// tracked; a deleted entity contributes its recorded events followed
    /// by its terminal event. The append is atomic and conditioned on
    /// every touched stream sitting at `expected`; a mismatch surfaces as
    /// [`EntityStoreError::Conflict`] with nothing appended, and the store
    /// performs no retry or merge. With nothing to save, the call returns
    /// `expected` unchanged without touching the log.
    ///
    /// No transaction state is modified until the append has succeeded, so
    /// cancelling (dropping) the future mid-append leaves the tracked
    /// change table exactly as it was. On success the saved entities stay
    /// readable in this transaction but are dropped at disposal rather
    /// than returned to the cache: a multi-stream commit leaves the
    /// per-stream resulting revision ambiguous, and the cache's own
    /// invalidation feed will notice the new events.
    #[instrument(skip(self), fields(expected = %expected))]
    pub async fn save_changes(
        &mut self,
        expected: StreamRevision,
    ) -> EntityStoreResult<StreamRevision> {
        let to_append = self.collect_events();
        if to_append.is_empty() {
            debug!("nothing to save");
            return Ok(expected);
        }
        debug!(events = to_append.len(), "appending recorded events");
        let new_revision = self.log.append(to_append, expected).await?;
        self.identity.retain(|_, tracked| {
            if tracked.state == TrackingState::Deleted {
                return false;
            }
            if tracked.state.is_dirty() {
                tracked.entity.clear_pending_events();
                tracked.state = TrackingState::Untracked;
                tracked.provenance = Provenance::Committed;
            }
            true
        });
        Ok(new_revision)
    }

    /// Ends the transaction without committing.
    ///
    /// Equivalent to dropping the store; provided for call sites that want
    /// the disposal to read explicitly. Consuming `self` makes any further
    /// use a compile error.
    pub fn dispose(self) {}

    /// The revision the tracked entity for `stream_id` was checked out at,
    /// if this transaction is tracking one with a known revision.
    pub fn loaded_revision(&self, stream_id: &StreamId) -> Option<StreamRevision> {
        self.identity
            .get(stream_id)
            .and_then(|tracked| tracked.provenance.checkout_revision())
    }

    /// The tracking state of the entity for `stream_id`, if tracked.
    pub fn tracking_state(&self, stream_id: &StreamId) -> Option<TrackingState> {
        self.identity.get(stream_id).map(|tracked| tracked.state)
    }

    fn collect_events(&self) -> Vec<EventToAppend> {
        let mut dirty: Vec<(&StreamId, &Tracked)> = self
            .identity
            .iter()
            .filter(|(_, tracked)| tracked.state.is_dirty())
            .collect();
        dirty.sort_by_key(|(_, tracked)| tracked.order);

        let mut to_append = Vec::new();
        for (stream_id, tracked) in dirty {
            for pending in tracked.entity.pending_events() {
                to_append.push(EventToAppend::from_pending(stream_id.clone(), pending));
            }
            if tracked.state == TrackingState::Deleted {
                to_append.push(EventToAppend::from_pending(
                    stream_id.clone(),
                    tracked.entity.removal_event(),
                ));
            }
        }
        to_append
    }

    fn bump(op_seq: &mut u64) -> u64 {
        *op_seq += 1;
        *op_seq
    }
}

impl Drop for EntityStore {
    fn drop(&mut self) {
        let identity = mem::take(&mut self.identity);
        for (stream_id, tracked) in identity {
            if tracked.state != TrackingState::Untracked {
                continue;
            }
            if let Some(revision) = tracked.provenance.checkout_revision() {
                self.cache.release(&stream_id, revision, tracked.entity);
            }
        }
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("tracked", &self.identity.len())
            .finish_non_exhaustive()
    }
}
