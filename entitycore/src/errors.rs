//! Error types for `EntityCore`.
//!
//! Each subsystem carries its own `thiserror` taxonomy; conversions between
//! layers preserve the distinction that matters to callers, most notably
//! that a log revision conflict surfaces from the store as
//! [`EntityStoreError::Conflict`] rather than a generic log failure.
//!
//! "Not found" is deliberately absent: a stream with no events and no
//! locally tracked creation is a normal `Ok(None)` result, never an error.
//! The core never logs-and-swallows; everything here propagates to the
//! immediate caller of the operation that detected it.

use std::time::Duration;

use thiserror::Error;

use crate::event::EventKind;
use crate::tracking::TrackingState;
use crate::types::{EventId, StreamId, StreamRevision};

/// Errors raised while folding a stream's events into an entity.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// No replay function is registered for an event encountered in the
    /// log. This is a data-integrity error - the log contains an event
    /// nobody knows how to apply - and retrying cannot fix it.
    #[error("no replayer registered for event '{kind}' (entity type {entity_type:?})")]
    ReplayerMissing {
        /// The event kind that could not be resolved.
        kind: EventKind,
        /// The entity type the walk started from, if an entity existed.
        entity_type: Option<&'static str>,
    },

    /// A replay function failed while applying an event. Apply errors are
    /// never swallowed: a partially reconstructed entity must not reach a
    /// business transaction.
    #[error("replayer for event '{kind}' failed: {source}")]
    ApplyFailed {
        /// The event kind being applied.
        kind: EventKind,
        /// The underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A typed replayer received a payload of the wrong runtime type.
    /// Indicates a registration keyed under the wrong kind.
    #[error("event '{actual}' delivered to replayer registered for '{expected}'")]
    EventTypeMismatch {
        /// The kind the replayer was registered under.
        expected: EventKind,
        /// The kind actually delivered.
        actual: EventKind,
    },
}

/// Errors from the external event log collaborator.
///
/// Transient I/O failures pass through unmodified; retry policy belongs to
/// the log collaborator, not this core.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// An append was rejected because a touched stream's current revision
    /// did not equal the expected revision.
    #[error(
        "revision conflict on stream '{stream}': expected {expected}, but current is {current}"
    )]
    RevisionConflict {
        /// The stream that conflicted.
        stream: StreamId,
        /// The revision the caller expected.
        expected: StreamRevision,
        /// The stream's actual current revision.
        current: StreamRevision,
    },

    /// An event with this id has already been committed.
    #[error("duplicate event id: {0}")]
    DuplicateEventId(EventId),

    /// The connection to the log failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation timed out.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from a shared-cache checkout, which may read and fold the log.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The fold over the stream's events failed.
    #[error(transparent)]
    Replay(#[from] ReplayError),

    /// Reading the stream from the log failed.
    #[error("event log error: {0}")]
    Log(#[from] EventLogError),
}

/// Errors from the per-transaction entity store.
#[derive(Debug, Error)]
pub enum EntityStoreError {
    /// The log rejected the save because another writer committed first.
    /// The store performs no retry, merge, or backoff; resolution is the
    /// caller's decision.
    #[error(
        "concurrency conflict on stream '{stream}': expected revision {expected}, but current is {current}"
    )]
    Conflict {
        /// The stream that conflicted.
        stream: StreamId,
        /// The revision the transaction started from.
        expected: StreamRevision,
        /// The stream's actual current revision.
        current: StreamRevision,
    },

    /// A tracking operation violated the state-transition table.
    #[error("illegal {operation} for entity in tracking state {state:?}")]
    IllegalTransition {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the entity was in.
        state: TrackingState,
    },

    /// The operation requires an entity this transaction is not tracking.
    #[error("entity for stream '{stream}' is not tracked by this transaction")]
    NotTracked {
        /// The untracked stream id.
        stream: StreamId,
    },

    /// Replay failed while loading an entity.
    #[error(transparent)]
    Replay(ReplayError),

    /// A non-conflict event log failure.
    #[error("event log error: {0}")]
    Log(EventLogError),
}

/// Type alias for event log results.
pub type EventLogResult<T> = Result<T, EventLogError>;

/// Type alias for cache results.
pub type CacheResult<T> = Result<T, CacheError>;

/// Type alias for entity store results.
pub type EntityStoreResult<T> = Result<T, EntityStoreError>;

impl From<EventLogError> for EntityStoreError {
    fn from(err: EventLogError) -> Self {
        match err {
            EventLogError::RevisionConflict {
                stream,
                expected,
                current,
            } => Self::Conflict {
                stream,
                expected,
                current,
            },
            other => Self::Log(other),
        }
    }
}

impl From<CacheError> for EntityStoreError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Replay(replay) => Self::Replay(replay),
            CacheError::Log(log) => log.into(),
        }
    }
}
