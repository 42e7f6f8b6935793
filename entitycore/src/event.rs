//! Domain event abstractions.
//!
//! Events are opaque to this layer: the core only needs a stable type tag
//! for replayer resolution and `Any` access so registered replay functions
//! can downcast to their concrete payload type. Serialization of event
//! payloads is an adapter concern and deliberately absent here.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::types::EventId;

/// Stable identifier for an event's runtime type.
///
/// The tag is what the replayer registry keys on, so it must stay constant
/// across builds and processes that share a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKind(&'static str);

impl EventKind {
    /// Creates an event kind from a stable name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the stable name of this kind.
    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// An immutable domain event belonging to one stream.
///
/// Implementations are plain data: the core never mutates an event once it
/// has been produced, and events for a stream are never reordered after
/// commit.
pub trait DomainEvent: Any + Send + Sync + fmt::Debug {
    /// The stable type tag used for replayer resolution.
    fn kind(&self) -> EventKind;

    /// `Any` access for downcasting inside typed replay functions.
    fn as_any(&self) -> &dyn Any;
}

/// An event produced by an entity mutation but not yet committed.
///
/// Pending events are held inside the producing entity until the owning
/// transaction saves; the id is generated at recording time so the append
/// order within an entity is reflected in id order.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    /// Unique identifier assigned when the event was recorded.
    pub event_id: EventId,
    /// The event payload.
    pub payload: Arc<dyn DomainEvent>,
}

impl PendingEvent {
    /// Records a new pending event around the given payload.
    pub fn new(payload: impl DomainEvent) -> Self {
        Self::from_arc(Arc::new(payload))
    }

    /// Records a new pending event around an already-shared payload.
    pub fn from_arc(payload: Arc<dyn DomainEvent>) -> Self {
        Self {
            event_id: EventId::new(),
            payload,
        }
    }

    /// The type tag of the wrapped payload.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
