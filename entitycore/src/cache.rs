//! Shared entity cache: per-stream loan slots with revision-based
//! invalidation.
//!
//! The cache holds at most one reconstructed instance per stream id. A
//! checkout either takes the parked instance (the caller becomes its sole
//! owner until release) or replays the stream from the log; a release
//! re-enters the slot only when the caller's revision still matches the
//! slot's record. Invalidation empties the slot and bumps an epoch so a
//! checkout racing an invalidation can serve stale data tagged with the
//! old revision, but can never install that data as current.
//!
//! Slots live in a sharded concurrent map, so checkout and release for
//! different streams never contend on a global lock, and no lock is held
//! across log I/O.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::entity::Entity;
use crate::errors::CacheResult;
use crate::event_log::EventLog;
use crate::replayer::{replay_stream, ReplayerRegistry};
use crate::types::{StreamId, StreamRevision};

/// How a checkout obtained its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutOrigin {
    /// Taken from the loan slot (or answered from a recorded absence).
    Pool,
    /// Freshly reconstructed by folding the stream from the log.
    Replayed,
}

/// Result of a cache checkout.
///
/// `entity` is `None` when the stream has no surviving entity (no events,
/// or folded to absent by a terminal event). The revision is what the
/// caller must pass back on release, and what an optimistic save started
/// from this checkout should expect.
#[derive(Debug)]
pub struct Checkout {
    /// The checked-out instance, if the stream reconstructs to one.
    pub entity: Option<Box<dyn Entity>>,
    /// The stream revision the instance (or absence) corresponds to.
    pub revision: StreamRevision,
    /// How the instance was obtained.
    pub origin: CheckoutOrigin,
}

enum LoanSlot {
    /// Invalidated: nothing recorded, next checkout must re-read the log.
    Vacant,
    /// Instance parked and available for checkout.
    Available(Box<dyn Entity>),
    /// Instance checked out by a transaction.
    Loaned,
    /// Stream reconstructed to no entity at the recorded revision.
    Absent,
}

struct CacheEntry {
    slot: LoanSlot,
    revision: StreamRevision,
    /// Bumped by every invalidation; guards against installing a revision
    /// observed by a log read that an invalidation overlapped.
    epoch: u64,
}

enum MissKind {
    /// No entry for this stream yet.
    First,
    /// Entry was invalidated; re-read and install if the epoch still
    /// matches.
    Reload(u64),
    /// Instance is on loan elsewhere; replay a fresh copy without
    /// touching the slot.
    Bypass,
}

/// Process-wide pool of reconstructed entities, keyed by stream id.
///
/// Safe for concurrent use by any number of transactions. Construct one
/// explicitly and share it (`Arc`) with every transaction-scoped
/// [`crate::store::EntityStore`]; there is no hidden global instance.
pub struct EntityCache {
    log: Arc<dyn EventLog>,
    registry: Arc<ReplayerRegistry>,
    slots: DashMap<StreamId, CacheEntry>,
}

impl EntityCache {
    /// Creates a cache reading from `log` and folding through `registry`.
    pub fn new(log: Arc<dyn EventLog>, registry: Arc<ReplayerRegistry>) -> Self {
        Self {
            log,
            registry,
            slots: DashMap::new(),
        }
    }

    /// Checks out the entity for `stream_id`.
    ///
    /// An occupied slot is emptied atomically and its instance handed to
    /// the caller as sole owner. A recorded absence answers without
    /// touching the log. Otherwise the full stream is read and folded
    /// through the replayer registry, starting from an absent entity.
    #[instrument(skip(self), fields(stream = %stream_id))]
    pub async fn checkout(&self, stream_id: &StreamId) -> CacheResult<Checkout> {
        let miss = if let Some(mut entry) = self.slots.get_mut(stream_id) {
            match std::mem::replace(&mut entry.slot, LoanSlot::Loaned) {
                LoanSlot::Available(entity) => {
                    debug!("checkout served from loan slot");
                    return Ok(Checkout {
                        entity: Some(entity),
                        revision: entry.revision,
                        origin: CheckoutOrigin::Pool,
                    });
                }
                LoanSlot::Absent => {
                    entry.slot = LoanSlot::Absent;
                    debug!("checkout answered from recorded absence");
                    return Ok(Checkout {
                        entity: None,
                        revision: entry.revision,
                        origin: CheckoutOrigin::Pool,
                    });
                }
                LoanSlot::Loaned => {
                    entry.slot = LoanSlot::Loaned;
                    MissKind::Bypass
                }
                LoanSlot::Vacant => {
                    entry.slot = LoanSlot::Vacant;
                    MissKind::Reload(entry.epoch)
                }
            }
        } else {
            MissKind::First
        };

        let events = self.log.read_stream(stream_id).await?;
        let (entity, mut revision) = replay_stream(&self.registry, events).await?;
        if revision.is_initial() {
            // No events were seen; ask the log for the authoritative
            // revision so a compacted or truncated stream is not recorded
            // as never-written.
            revision = self.log.revision(stream_id).await?;
        }
        debug!(%revision, occupied = entity.is_some(), "stream replayed from log");

        let occupied = entity.is_some();
        match self.slots.entry(stream_id.clone()) {
            Entry::Vacant(vacant) => {
                if matches!(miss, MissKind::First) {
                    vacant.insert(CacheEntry {
                        slot: if occupied {
                            LoanSlot::Loaned
                        } else {
                            LoanSlot::Absent
                        },
                        revision,
                        epoch: 0,
                    });
                }
            }
            Entry::Occupied(mut parked) => {
                let entry = parked.get_mut();
                if let MissKind::Reload(epoch) = miss {
                    if matches!(entry.slot, LoanSlot::Vacant) && entry.epoch == epoch {
                        entry.revision = revision;
                        entry.slot = if occupied {
                            LoanSlot::Loaned
                        } else {
                            LoanSlot::Absent
                        };
                    }
                }
                // First-load races and bypasses leave the entry alone: the
                // slot protocol already has an owner for it.
            }
        }

        Ok(Checkout {
            entity,
            revision,
            origin: CheckoutOrigin::Replayed,
        })
    }

    /// Returns a checked-out instance to the loan slot.
    ///
    /// Accepted only when the slot is still on loan and `revision` matches
    /// the slot's record; otherwise the instance is dropped silently so a
    /// copy computed against an outdated log position can never re-enter
    /// circulation.
    pub fn release(&self, stream_id: &StreamId, revision: StreamRevision, entity: Box<dyn Entity>) {
        if let Some(mut entry) = self.slots.get_mut(stream_id) {
            if matches!(entry.slot, LoanSlot::Loaned) && entry.revision == revision {
                entry.slot = LoanSlot::Available(entity);
                return;
            }
        }
        debug!(stream = %stream_id, %revision, "released instance dropped as stale");
    }

    /// Invalidation hook: new events were durably committed for
    /// `stream_id` (by any transaction or process).
    ///
    /// Empties the slot and forgets the recorded revision, forcing the
    /// next checkout to replay from the log; an instance currently on loan
    /// will be dropped at release because its revision no longer matches.
    pub fn invalidate(&self, stream_id: &StreamId) {
        match self.slots.entry(stream_id.clone()) {
            Entry::Occupied(mut parked) => {
                let entry = parked.get_mut();
                entry.slot = LoanSlot::Vacant;
                entry.revision = StreamRevision::initial();
                entry.epoch += 1;
            }
            Entry::Vacant(vacant) => {
                // Leave a marker so an in-flight first read cannot install
                // a revision observed before this invalidation.
                vacant.insert(CacheEntry {
                    slot: LoanSlot::Vacant,
                    revision: StreamRevision::initial(),
                    epoch: 1,
                });
            }
        }
        debug!(stream = %stream_id, "stream invalidated");
    }

    /// The revision currently recorded for a stream, if any.
    ///
    /// `None` for streams never loaded or invalidated since.
    pub fn recorded_revision(&self, stream_id: &StreamId) -> Option<StreamRevision> {
        self.slots.get(stream_id).and_then(|entry| {
            if matches!(entry.slot, LoanSlot::Vacant) {
                None
            } else {
                Some(entry.revision)
            }
        })
    }
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("streams", &self.slots.len())
            .finish_non_exhaustive()
    }
}
