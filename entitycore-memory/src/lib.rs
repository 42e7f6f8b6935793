//! In-memory event log adapter for `EntityCore`
//!
//! This crate provides an in-memory implementation of the `EventLog` port
//! from the entitycore crate, useful for testing and development scenarios
//! where persistence is not required. It also exposes a commit-listener
//! hook standing in for the external invalidation feed, so tests can wire
//! committed appends straight into `EntityCache::invalidate`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};

use entitycore::errors::{EventLogError, EventLogResult};
use entitycore::event_log::{group_by_stream, EventLog, EventStream, EventToAppend, RecordedEvent};
use entitycore::types::{EventId, StreamId, StreamRevision};

/// A callback invoked after a commit, once per touched stream.
pub type CommitListener = Box<dyn Fn(&StreamId) + Send + Sync>;

#[derive(Default)]
struct LogState {
    // Maps stream IDs to their committed events, in append order
    streams: HashMap<StreamId, Vec<RecordedEvent>>,
    // All committed event ids, for duplicate rejection
    event_ids: HashSet<EventId>,
}

impl LogState {
    fn current_revision(&self, stream_id: &StreamId) -> StreamRevision {
        self.streams
            .get(stream_id)
            .and_then(|events| events.last())
            .map_or_else(StreamRevision::initial, |event| event.revision)
    }
}

/// Thread-safe in-memory event log for testing
pub struct InMemoryEventLog {
    state: Arc<RwLock<LogState>>,
    listeners: Arc<RwLock<Vec<CommitListener>>>,
}

impl InMemoryEventLog {
    /// Create a new empty in-memory event log
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(LogState::default())),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Registers a commit listener, called once per stream touched by a
    /// successful append. This stands in for the external invalidation
    /// feed: wire it to `EntityCache::invalidate` to propagate commits.
    pub fn on_commit(&self, listener: impl Fn(&StreamId) + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("RwLock poisoned")
            .push(Box::new(listener));
    }

    /// The number of committed events in a stream (test helper).
    pub fn event_count(&self, stream_id: &StreamId) -> usize {
        self.state
            .read()
            .expect("RwLock poisoned")
            .streams
            .get(stream_id)
            .map_or(0, Vec::len)
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for InMemoryEventLog {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            listeners: Arc::clone(&self.listeners),
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn read_stream(&self, stream_id: &StreamId) -> EventLogResult<EventStream> {
        let events = self
            .state
            .read()
            .expect("RwLock poisoned")
            .streams
            .get(stream_id)
            .cloned()
            .unwrap_or_default();
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn revision(&self, stream_id: &StreamId) -> EventLogResult<StreamRevision> {
        Ok(self
            .state
            .read()
            .expect("RwLock poisoned")
            .current_revision(stream_id))
    }

    async fn append(
        &self,
        events: Vec<EventToAppend>,
        expected: StreamRevision,
    ) -> EventLogResult<StreamRevision> {
        let mut touched = Vec::new();
        let new_revision = {
            let mut state = self.state.write().expect("RwLock poisoned");
            let grouped = group_by_stream(&events);

            // Verify everything before writing anything: the append is
            // all-or-nothing.
            for (stream_id, _) in &grouped {
                let current = state.current_revision(stream_id);
                if current != expected {
                    return Err(EventLogError::RevisionConflict {
                        stream: stream_id.clone(),
                        expected,
                        current,
                    });
                }
            }
            for event in &events {
                if state.event_ids.contains(&event.event_id) {
                    return Err(EventLogError::DuplicateEventId(event.event_id));
                }
            }

            let mut high_water = expected;
            for (stream_id, batch) in grouped {
                let mut revision = state.current_revision(&stream_id);
                let committed = state.streams.entry(stream_id.clone()).or_default();
                for event in batch {
                    revision = revision.next();
                    committed.push(RecordedEvent {
                        event_id: event.event_id,
                        stream_id: stream_id.clone(),
                        revision,
                        recorded_at: Utc::now(),
                        payload: Arc::clone(&event.payload),
                    });
                }
                high_water = high_water.max(revision);
                touched.push(stream_id);
            }
            for event in &events {
                state.event_ids.insert(event.event_id);
            }
            high_water
        };

        // Notify outside the state lock so listeners may call back into
        // the log.
        let listeners = self.listeners.read().expect("RwLock poisoned");
        for stream_id in &touched {
            for listener in listeners.iter() {
                listener(stream_id);
            }
        }

        Ok(new_revision)
    }
}
