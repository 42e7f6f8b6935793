//! The external event log port.
//!
//! The durable log is a collaborator, not part of this core: this module
//! only fixes the interface the reconstruction and save pipeline consumes.
//! Streams are append-only and totally ordered; appends are atomic and
//! conditioned on the caller's expected revision (optimistic concurrency).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::errors::EventLogResult;
use crate::event::{DomainEvent, PendingEvent};
use crate::types::{EventId, StreamId, StreamRevision};

/// An ordered, possibly I/O-backed sequence of recorded events.
pub type EventStream = BoxStream<'static, EventLogResult<RecordedEvent>>;

/// An event as it exists in the log: payload plus position metadata.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Unique identifier of this event.
    pub event_id: EventId,
    /// The stream this event belongs to.
    pub stream_id: StreamId,
    /// The stream revision after this event was appended.
    pub revision: StreamRevision,
    /// When the log durably recorded the event.
    pub recorded_at: DateTime<Utc>,
    /// The event payload.
    pub payload: Arc<dyn DomainEvent>,
}

/// An uncommitted event destined for a specific stream.
#[derive(Debug, Clone)]
pub struct EventToAppend {
    /// Unique identifier of this event.
    pub event_id: EventId,
    /// The stream to append to.
    pub stream_id: StreamId,
    /// The event payload.
    pub payload: Arc<dyn DomainEvent>,
}

impl EventToAppend {
    /// Addresses a pending event to the given stream.
    pub fn from_pending(stream_id: StreamId, pending: PendingEvent) -> Self {
        Self {
            event_id: pending.event_id,
            stream_id,
            payload: pending.payload,
        }
    }
}

/// The append-only event log collaborator.
///
/// Implementations must keep the events of a stream totally ordered by
/// append and never mutate or drop a committed event. All operations may
/// suspend on I/O; none of them retries on failure - transient errors
/// surface to the caller unmodified.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Reads the full event history of a stream in append order.
    ///
    /// A stream with no committed events yields an empty sequence; that is
    /// a normal result, not an error.
    async fn read_stream(&self, stream_id: &StreamId) -> EventLogResult<EventStream>;

    /// Returns the current revision of a stream.
    ///
    /// Streams with no committed events report [`StreamRevision::initial`].
    async fn revision(&self, stream_id: &StreamId) -> EventLogResult<StreamRevision>;

    /// Atomically appends events, possibly across several streams.
    ///
    /// The append succeeds only if every touched stream's current revision
    /// equals `expected`; otherwise it fails with
    /// [`crate::errors::EventLogError::RevisionConflict`] and commits
    /// nothing. Returns the highest revision assigned by this append (for
    /// a single-stream append, that stream's new revision).
    async fn append(
        &self,
        events: Vec<EventToAppend>,
        expected: StreamRevision,
    ) -> EventLogResult<StreamRevision>;
}

/// Groups events to append by their target stream, preserving the order of
/// first touch and the order of events within each stream.
///
/// Adapters typically need this to run their per-stream revision checks;
/// it lives here so they do not each reimplement it.
pub fn group_by_stream(events: &[EventToAppend]) -> Vec<(StreamId, Vec<&EventToAppend>)> {
    let mut order: Vec<StreamId> = Vec::new();
    let mut grouped: HashMap<StreamId, Vec<&EventToAppend>> = HashMap::new();
    for event in events {
        if !grouped.contains_key(&event.stream_id) {
            order.push(event.stream_id.clone());
        }
        grouped.entry(event.stream_id.clone()).or_default().push(event);
    }
    order
        .into_iter()
        .map(|id| {
            let batch = grouped.remove(&id).unwrap_or_default();
            (id, batch)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::any::Any;

    #[derive(Debug)]
    struct Noted(&'static str);

    impl DomainEvent for Noted {
        fn kind(&self) -> EventKind {
            EventKind::new("Noted")
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn to_append(stream: &str, tag: &'static str) -> EventToAppend {
        EventToAppend::from_pending(
            StreamId::try_new(stream).unwrap(),
            PendingEvent::new(Noted(tag)),
        )
    }

    #[test]
    fn from_pending_keeps_event_id_and_payload() {
        let pending = PendingEvent::new(Noted("a"));
        let id = pending.event_id;
        let event = EventToAppend::from_pending(StreamId::try_new("s-1").unwrap(), pending);
        assert_eq!(event.event_id, id);
        assert_eq!(event.payload.kind(), EventKind::new("Noted"));
    }

    #[test]
    fn group_by_stream_preserves_first_touch_and_inner_order() {
        let events = vec![
            to_append("a", "a1"),
            to_append("b", "b1"),
            to_append("a", "a2"),
        ];
        let grouped = group_by_stream(&events);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0.as_ref(), "a");
        assert_eq!(grouped[0].1.len(), 2);
        assert_eq!(grouped[1].0.as_ref(), "b");
        assert_eq!(grouped[1].1.len(), 1);
        let tags: Vec<_> = grouped[0]
            .1
            .iter()
            .map(|e| e.payload.as_any().downcast_ref::<Noted>().unwrap().0)
            .collect();
        assert_eq!(tags, vec!["a1", "a2"]);
    }
}
