//! Shared fixtures for the crate's unit tests: a small ticket domain, a
//! replayer registry wired for it, and a stub event log.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::entity::{Entity, EntityTypeInfo};
use crate::errors::{EventLogError, EventLogResult, ReplayError};
use crate::event::{DomainEvent, EventKind, PendingEvent};
use crate::event_log::{group_by_stream, EventLog, EventStream, EventToAppend, RecordedEvent};
use crate::replayer::ReplayerRegistry;
use crate::types::{EventId, StreamId, StreamRevision};

pub(crate) static TICKET: EntityTypeInfo = EntityTypeInfo::root("Ticket");
pub(crate) static ESCALATED_TICKET: EntityTypeInfo =
    EntityTypeInfo::derived("EscalatedTicket", &TICKET);

pub(crate) const TICKET_OPENED: EventKind = EventKind::new("TicketOpened");
pub(crate) const TICKET_ASSIGNED: EventKind = EventKind::new("TicketAssigned");
pub(crate) const TICKET_CLOSED: EventKind = EventKind::new("TicketClosed");

#[derive(Debug)]
pub(crate) struct TicketOpened {
    pub stream: String,
}

impl DomainEvent for TicketOpened {
    fn kind(&self) -> EventKind {
        TICKET_OPENED
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub(crate) struct TicketAssigned {
    pub assignee: String,
}

impl DomainEvent for TicketAssigned {
    fn kind(&self) -> EventKind {
        TICKET_ASSIGNED
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub(crate) struct TicketClosed;

impl DomainEvent for TicketClosed {
    fn kind(&self) -> EventKind {
        TICKET_CLOSED
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub(crate) struct Ticket {
    id: StreamId,
    pub assignee: Option<String>,
    pending: Vec<PendingEvent>,
}

impl Ticket {
    /// Creates a brand-new ticket, recording its creation event.
    pub fn open(id: &str) -> Self {
        let mut ticket = Self::from_opened(&TicketOpened {
            stream: id.to_string(),
        });
        ticket.pending.push(PendingEvent::new(TicketOpened {
            stream: id.to_string(),
        }));
        ticket
    }

    /// Replay construction: no pending events recorded.
    pub fn from_opened(event: &TicketOpened) -> Self {
        Self {
            id: StreamId::try_new(event.stream.clone()).expect("fixture stream id"),
            assignee: None,
            pending: Vec::new(),
        }
    }

    /// Business mutation: updates state and records the event.
    pub fn assign(&mut self, assignee: &str) {
        self.apply_assigned(&TicketAssigned {
            assignee: assignee.to_string(),
        });
        self.pending.push(PendingEvent::new(TicketAssigned {
            assignee: assignee.to_string(),
        }));
    }

    /// Replay application: state only.
    pub fn apply_assigned(&mut self, event: &TicketAssigned) {
        self.assignee = Some(event.assignee.clone());
    }
}

impl Entity for Ticket {
    fn type_info(&self) -> &'static EntityTypeInfo {
        &TICKET
    }

    fn stream_id(&self) -> &StreamId {
        &self.id
    }

    fn pending_events(&self) -> Vec<PendingEvent> {
        self.pending.clone()
    }

    fn clear_pending_events(&mut self) {
        self.pending.clear();
    }

    fn removal_event(&self) -> PendingEvent {
        PendingEvent::new(TicketClosed)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A refined ticket type; exists so tests can request the wrong concrete
/// type and exercise ancestry walks.
#[derive(Debug)]
pub(crate) struct EscalatedTicket {
    id: StreamId,
    pending: Vec<PendingEvent>,
}

impl Entity for EscalatedTicket {
    fn type_info(&self) -> &'static EntityTypeInfo {
        &ESCALATED_TICKET
    }

    fn stream_id(&self) -> &StreamId {
        &self.id
    }

    fn pending_events(&self) -> Vec<PendingEvent> {
        self.pending.clone()
    }

    fn clear_pending_events(&mut self) {
        self.pending.clear();
    }

    fn removal_event(&self) -> PendingEvent {
        PendingEvent::new(TicketClosed)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) fn ticket_opened(stream: &str) -> TicketOpened {
    TicketOpened {
        stream: stream.to_string(),
    }
}

pub(crate) fn ticket_assigned(assignee: &str) -> TicketAssigned {
    TicketAssigned {
        assignee: assignee.to_string(),
    }
}

pub(crate) fn ticket_closed() -> TicketClosed {
    TicketClosed
}

pub(crate) fn stream_id(raw: &str) -> StreamId {
    StreamId::try_new(raw).expect("fixture stream id")
}

pub(crate) fn recorded(stream: &str, revision: u64, payload: impl DomainEvent) -> RecordedEvent {
    RecordedEvent {
        event_id: EventId::new(),
        stream_id: stream_id(stream),
        revision: StreamRevision::try_new(revision).expect("fixture revision"),
        recorded_at: Utc::now(),
        payload: Arc::new(payload),
    }
}

/// Registry wired for the ticket domain: open constructs, assign mutates,
/// close is terminal.
pub(crate) fn ticket_registry() -> ReplayerRegistry {
    let registry = ReplayerRegistry::new();
    registry.register_event::<TicketOpened, _>(TICKET_OPENED, &TICKET, |event, _prior| {
        Ok(Some(Box::new(Ticket::from_opened(event))))
    });
    registry.register_event::<TicketAssigned, _>(TICKET_ASSIGNED, &TICKET, |event, prior| {
        let mut boxed = prior.ok_or_else(|| ReplayError::ApplyFailed {
            kind: TICKET_ASSIGNED,
            source: "ticket assigned before it was opened".into(),
        })?;
        let ticket = boxed
            .as_any_mut()
            .downcast_mut::<Ticket>()
            .ok_or_else(|| ReplayError::ApplyFailed {
                kind: TICKET_ASSIGNED,
                source: "assignment replayed onto a non-ticket entity".into(),
            })?;
        ticket.apply_assigned(event);
        Ok(Some(boxed))
    });
    registry.register_event::<TicketClosed, _>(TICKET_CLOSED, &TICKET, |_event, _prior| Ok(None));
    registry
}

/// Minimal in-crate event log double; counts reads so cache tests can
/// assert when the log was (not) consulted.
pub(crate) struct StubLog {
    streams: RwLock<HashMap<StreamId, Vec<RecordedEvent>>>,
    reads: AtomicUsize,
}

impl StubLog {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            reads: AtomicUsize::new(0),
        }
    }

    /// Appends a committed event directly, bypassing concurrency checks.
    pub fn seed(&self, stream: &str, payload: impl DomainEvent) {
        let id = stream_id(stream);
        let mut streams = self.streams.write().expect("RwLock poisoned");
        let events = streams.entry(id.clone()).or_default();
        let revision = events
            .last()
            .map_or_else(StreamRevision::initial, |event| event.revision)
            .next();
        events.push(RecordedEvent {
            event_id: EventId::new(),
            stream_id: id,
            revision,
            recorded_at: Utc::now(),
            payload: Arc::new(payload),
        });
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn event_count(&self, stream: &str) -> usize {
        self.streams
            .read()
            .expect("RwLock poisoned")
            .get(&stream_id(stream))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl EventLog for StubLog {
    async fn read_stream(&self, stream_id: &StreamId) -> EventLogResult<EventStream> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let events = self
            .streams
            .read()
            .expect("RwLock poisoned")
            .get(stream_id)
            .cloned()
            .unwrap_or_default();
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn revision(&self, stream_id: &StreamId) -> EventLogResult<StreamRevision> {
        Ok(self
            .streams
            .read()
            .expect("RwLock poisoned")
            .get(stream_id)
            .and_then(|events| events.last())
            .map_or_else(StreamRevision::initial, |event| event.revision))
    }

    async fn append(
        &self,
        events: Vec<EventToAppend>,
        expected: StreamRevision,
    ) -> EventLogResult<StreamRevision> {
        let mut streams = self.streams.write().expect("RwLock poisoned");
        let grouped = group_by_stream(&events);
        for (stream, _) in &grouped {
            let current = streams
                .get(stream)
                .and_then(|events| events.last())
                .map_or_else(StreamRevision::initial, |event| event.revision);
            if current != expected {
                return Err(EventLogError::RevisionConflict {
                    stream: stream.clone(),
                    expected,
                    current,
                });
            }
        }
        let mut high_water = expected;
        for (stream, batch) in grouped {
            let committed = streams.entry(stream.clone()).or_default();
            let mut revision = committed
                .last()
                .map_or_else(StreamRevision::initial, |event| event.revision);
            for event in batch {
                revision = revision.next();
                committed.push(RecordedEvent {
                    event_id: event.event_id,
                    stream_id: stream.clone(),
                    revision,
                    recorded_at: Utc::now(),
                    payload: Arc::clone(&event.payload),
                });
            }
            high_water = high_water.max(revision);
        }
        Ok(high_water)
    }
}
