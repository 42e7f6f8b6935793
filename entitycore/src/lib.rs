//! `EntityCore` - loan-based entity store over an append-only event log
//!
//! This library reconstructs domain entities by folding ordered event
//! streams, pools the reconstructed instances in a shared cache with a
//! strict loan protocol (at most one live instance per stream), and
//! persists new events back to the log under optimistic concurrency
//! control.
//!
//! The three building blocks, leaves first:
//!
//! - [`replayer::ReplayerRegistry`] maps an event kind and an entity's
//!   declared type ancestry to the function that applies the event.
//! - [`cache::EntityCache`] lends out at most one reconstructed instance
//!   per stream and invalidates entries when new events are committed.
//! - [`store::EntityStore`] is the per-transaction unit of work: identity
//!   map, change tracking, and the optimistic save path.
//!
//! The durable log itself is an external collaborator behind the
//! [`event_log::EventLog`] port; see the `entitycore-memory` crate for an
//! in-memory implementation suitable for tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod entity;
pub mod errors;
pub mod event;
pub mod event_log;
pub mod replayer;
pub mod store;
pub mod tracking;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{Checkout, CheckoutOrigin, EntityCache};
pub use entity::{Entity, EntityTypeInfo};
pub use errors::{
    CacheError, CacheResult, EntityStoreError, EntityStoreResult, EventLogError, EventLogResult,
    ReplayError,
};
pub use event::{DomainEvent, EventKind, PendingEvent};
pub use event_log::{EventLog, EventStream, EventToAppend, RecordedEvent};
pub use replayer::{BoxedReplayer, RegistrationHandle, ReplayedEntity, ReplayerRegistry};
pub use store::EntityStore;
pub use tracking::{Transition, TrackingState};
pub use types::{EventId, StreamId, StreamRevision};
