//! Event-sourced aggregate wrapper.
//!
//! `Sourced<A>` pairs an aggregate's in-memory state with its replayed history
//! and the events raised since it was loaded. Repositories hand these out and
//! take them back to persist the pending part.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use chronicle_core::{Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, ETag};

use crate::command::Command;
use crate::event::EventSchema;
use crate::handler::execute;
use crate::scheduled::DependencyEvent;

/// An aggregate that can be persisted as an event stream and receive
/// scheduled commands.
pub trait EventSourced:
    Aggregate<
        Id = AggregateId,
        Error = DomainError,
        Command: Command + Serialize + DeserializeOwned,
        Event: EventSchema,
    > + Clone
    + core::fmt::Debug
    + Send
    + Sync
    + 'static
{
    /// Stable aggregate type name (e.g. "sales.order").
    const AGGREGATE_TYPE: &'static str;

    /// Event type whose payload is a `ScheduledCommand<Self::Command>`.
    ///
    /// Saving such an event hands the command to the scheduler.
    const COMMAND_SCHEDULED_EVENT: &'static str;

    /// State of an aggregate that has no events yet.
    fn empty(id: AggregateId) -> Self;
}

/// A historical event whose stored type is not one the aggregate knows.
///
/// Kept in place so sequence numbers stay contiguous and the original data is
/// not lost.
#[derive(Debug, Clone, PartialEq)]
pub struct AnonymousEvent {
    pub event_type: String,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoricalEvent<E> {
    Typed(E),
    Anonymous(AnonymousEvent),
}

impl<E> HistoricalEvent<E> {
    pub fn typed(&self) -> Option<&E> {
        match self {
            HistoricalEvent::Typed(event) => Some(event),
            HistoricalEvent::Anonymous(_) => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, HistoricalEvent::Anonymous(_))
    }
}

/// One committed entry of an aggregate's history.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent<E> {
    pub sequence_number: u64,
    pub etag: ETag,
    pub event: HistoricalEvent<E>,
}

/// An event raised since the aggregate was loaded, not yet saved.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent<E> {
    aggregate_id: AggregateId,
    etag: Option<ETag>,
    event: E,
}

impl<E> PendingEvent<E> {
    pub fn new(aggregate_id: AggregateId, event: E) -> Self {
        Self {
            aggregate_id,
            etag: None,
            event,
        }
    }

    pub fn event(&self) -> &E {
        &self.event
    }

    pub fn into_parts(self) -> (Option<ETag>, E) {
        (self.etag, self.event)
    }
}

impl<E: Send> DependencyEvent for PendingEvent<E> {
    fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    fn set_etag(&mut self, etag: ETag) {
        self.etag = Some(etag);
    }
}

#[derive(Debug, Clone)]
pub struct Sourced<A: EventSourced> {
    state: A,
    history: Vec<RecordedEvent<A::Event>>,
    pending: Vec<PendingEvent<A::Event>>,
}

impl<A: EventSourced> Sourced<A> {
    /// A new aggregate with no history.
    pub fn new(id: AggregateId) -> Self {
        Self {
            state: A::empty(id),
            history: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Rehydrate from committed history. Anonymous entries are kept but not applied.
    pub fn from_history(id: AggregateId, history: Vec<RecordedEvent<A::Event>>) -> Self {
        let mut state = A::empty(id);
        for recorded in &history {
            if let HistoricalEvent::Typed(event) = &recorded.event {
                state.apply(event);
            }
        }
        Self {
            state,
            history,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> AggregateId {
        *self.state.id()
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// Sequence number of the last committed event (0 for a new aggregate).
    pub fn version(&self) -> u64 {
        self.history.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    pub fn history(&self) -> &[RecordedEvent<A::Event>] {
        &self.history
    }

    pub fn pending_events(&self) -> &[PendingEvent<A::Event>] {
        &self.pending
    }

    pub fn pending_events_mut(&mut self) -> &mut [PendingEvent<A::Event>] {
        &mut self.pending
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Handle a command and record the resulting events as pending.
    ///
    /// A rejected command leaves the aggregate unchanged.
    pub fn apply_command(&mut self, command: &A::Command) -> DomainResult<()> {
        let id = self.id();
        let events = execute(&mut self.state, command)?;
        self.pending
            .extend(events.into_iter().map(|event| PendingEvent::new(id, event)));
        Ok(())
    }

    /// Apply an event directly, bypassing command handling.
    ///
    /// Used by failure handlers to record the outcome of a failed delivery.
    pub fn record(&mut self, event: A::Event) {
        self.state.apply(&event);
        let id = self.id();
        self.pending.push(PendingEvent::new(id, event));
    }

    /// Every known event in order: committed history, then pending.
    pub fn events(&self) -> impl Iterator<Item = &A::Event> + '_ {
        self.history
            .iter()
            .filter_map(|recorded| recorded.event.typed())
            .chain(self.pending.iter().map(PendingEvent::event))
    }

    pub fn last_event(&self) -> Option<&A::Event> {
        self.events().last()
    }

    pub fn take_pending(&mut self) -> Vec<PendingEvent<A::Event>> {
        std::mem::take(&mut self.pending)
    }

    /// Move freshly committed events into history.
    pub fn mark_committed(&mut self, committed: Vec<RecordedEvent<A::Event>>) {
        self.pending.clear();
        self.history.extend(committed);
    }

    /// Drop pending events, e.g. after a failed save.
    pub fn discard_pending(&mut self) -> Vec<PendingEvent<A::Event>> {
        self.take_pending()
    }
}
