//! Entity abstractions and the declared-supertype chain.
//!
//! Entities are mutable in-memory projections reconstructed by folding a
//! stream's events in order. A stream's events may replay into different
//! concrete types over its life (a base type refined into a subtype by a
//! later event), so replayer resolution walks an explicit ancestry chain
//! instead of relying on runtime reflection.

use std::any::Any;
use std::fmt;
use std::iter;

use crate::event::PendingEvent;
use crate::types::StreamId;

/// Static descriptor of an entity's runtime type.
///
/// Instances are expected to be `static` items, one per concrete entity
/// type, linked into a chain through `parent`. Type names must be unique
/// within a process: the replayer registry compares levels by name.
#[derive(Debug)]
pub struct EntityTypeInfo {
    /// Stable, process-unique name of this entity type.
    pub name: &'static str,
    /// The declared supertype, `None` for a hierarchy root.
    pub parent: Option<&'static EntityTypeInfo>,
}

impl EntityTypeInfo {
    /// Descriptor for a hierarchy root.
    pub const fn root(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    /// Descriptor for a type derived from `parent`.
    pub const fn derived(name: &'static str, parent: &'static EntityTypeInfo) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    /// Walks from this type to the hierarchy root, most derived first.
    pub fn ancestry(&'static self) -> impl Iterator<Item = &'static EntityTypeInfo> {
        iter::successors(Some(self), |current| current.parent)
    }

    /// Whether `ancestor` appears in this type's ancestry (including self).
    pub fn is_a(&'static self, ancestor: &EntityTypeInfo) -> bool {
        self.ancestry().any(|level| level == ancestor)
    }
}

impl PartialEq for EntityTypeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for EntityTypeInfo {}

/// A mutable in-memory projection of one event stream.
///
/// Implementations are plain data owned by exactly one party at a time:
/// the shared cache while parked in a loan slot, or the borrowing
/// transaction while checked out. Mutating methods on a concrete entity
/// record the events they produce; the owning transaction drains them at
/// save time.
pub trait Entity: Any + Send + Sync + fmt::Debug {
    /// The static type descriptor used for replayer resolution.
    fn type_info(&self) -> &'static EntityTypeInfo;

    /// The stream this entity is a projection of.
    fn stream_id(&self) -> &StreamId;

    /// Events recorded by mutations since the last commit, in recording
    /// order. Must not drain: the save path clears separately once the
    /// append has succeeded.
    fn pending_events(&self) -> Vec<PendingEvent>;

    /// Forgets all recorded-but-uncommitted events.
    fn clear_pending_events(&mut self);

    /// The terminal event appended when this entity is removed.
    fn removal_event(&self) -> PendingEvent;

    /// `Any` access for downcasting at the store boundary.
    fn as_any(&self) -> &dyn Any;

    /// Mutable `Any` access for downcasting at the store boundary.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
