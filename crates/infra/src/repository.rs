//! Event-sourced repositories.
//!
//! A repository loads an aggregate by replaying its stream and saves the events
//! raised since it was loaded:
//!
//! ```text
//! get_latest(id)
//!   1. Load events from store
//!   2. Validate ordering
//!   3. Resolve each stored (event_type, payload) to a typed or anonymous event
//!   4. Rehydrate
//!
//! save(aggregate)
//!   1. Wrap pending events (assigning etags where missing)
//!   2. Append with ExpectedVersion::Exact(aggregate.version())
//!   3. Move pending events into history
//!   4. Publish committed events to the bus
//! ```
//!
//! Publishing happens only after a successful append. Bus handlers run before
//! `save` returns, which is how commands scheduled by an aggregate reach the
//! scheduler. Once the append succeeded the save has happened: a failed
//! publish is logged, not returned, so callers never retry committed work.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use chronicle_core::{AggregateId, ETag, ExpectedVersion};
use chronicle_events::{
    AnonymousEvent, EventBus, EventEnvelope, EventSchema, EventSourced, HistoricalEvent,
    RecordedEvent, Sourced,
};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
use crate::migration::Rename;

/// The bus committed events are published on.
pub type SharedEventBus = Arc<dyn EventBus<EventEnvelope<JsonValue>>>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Optimistic concurrency failure (the stream moved since the aggregate was loaded).
    #[error("{0}")]
    Concurrency(String),

    /// The loaded stream is inconsistent (wrong aggregate, non-monotonic sequence).
    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    #[error("failed to deserialize '{event_type}' at sequence number {sequence_number}: {message}")]
    Deserialize {
        event_type: String,
        sequence_number: u64,
        message: String,
    },

    #[error(transparent)]
    Store(EventStoreError),
}

impl RepositoryError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, RepositoryError::Concurrency(_))
    }
}

impl From<EventStoreError> for RepositoryError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => RepositoryError::Concurrency(msg),
            other => RepositoryError::Store(other),
        }
    }
}

#[async_trait]
pub trait EventSourcedRepository<A: EventSourced>: Send + Sync {
    /// Latest state of the aggregate, or `None` if it has no events.
    async fn get_latest(&self, id: AggregateId) -> Result<Option<Sourced<A>>, RepositoryError>;

    /// Persist the aggregate's pending events.
    async fn save(&self, aggregate: &mut Sourced<A>) -> Result<(), RepositoryError>;
}

/// A repository that can rewrite the stored type names of past events.
#[async_trait]
pub trait MigratableRepository<A: EventSourced>: EventSourcedRepository<A> {
    async fn rename_events(&self, id: AggregateId, renames: &[Rename]) -> Result<(), RepositoryError>;
}

#[async_trait]
impl<A, R> EventSourcedRepository<A> for Arc<R>
where
    A: EventSourced,
    R: EventSourcedRepository<A> + ?Sized,
{
    async fn get_latest(&self, id: AggregateId) -> Result<Option<Sourced<A>>, RepositoryError> {
        (**self).get_latest(id).await
    }

    async fn save(&self, aggregate: &mut Sourced<A>) -> Result<(), RepositoryError> {
        (**self).save(aggregate).await
    }
}

/// Repository over any `EventStore`, publishing to an event bus.
pub struct EventStoreRepository<A, S> {
    store: S,
    bus: SharedEventBus,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, S> EventStoreRepository<A, S> {
    pub fn new(store: S, bus: SharedEventBus) -> Self {
        Self {
            store,
            bus,
            _aggregate: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }
}

impl<A, S> core::fmt::Debug for EventStoreRepository<A, S>
where
    S: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventStoreRepository")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<A, S> EventSourcedRepository<A> for EventStoreRepository<A, S>
where
    A: EventSourced,
    S: EventStore,
{
    async fn get_latest(&self, id: AggregateId) -> Result<Option<Sourced<A>>, RepositoryError> {
        let stream = self.store.load_stream(id)?;
        if stream.is_empty() {
            return Ok(None);
        }
        validate_loaded_stream(id, &stream)?;

        let history = stream
            .into_iter()
            .map(resolve::<A::Event>)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Sourced::from_history(id, history)))
    }

    async fn save(&self, aggregate: &mut Sourced<A>) -> Result<(), RepositoryError> {
        if !aggregate.has_pending_events() {
            return Ok(());
        }

        let id = aggregate.id();
        let expected = ExpectedVersion::Exact(aggregate.version());

        let mut uncommitted = Vec::with_capacity(aggregate.pending_events().len());
        for pending in aggregate.pending_events() {
            let etag = chronicle_events::DependencyEvent::etag(pending)
                .cloned()
                .unwrap_or_else(ETag::generate);
            uncommitted.push(UncommittedEvent::from_typed(
                id,
                A::AGGREGATE_TYPE,
                etag,
                pending.event(),
            )?);
        }

        // Pending events stay on the aggregate if the append fails.
        let committed = self.store.append(uncommitted, expected)?;

        let recorded = aggregate
            .take_pending()
            .into_iter()
            .zip(committed.iter())
            .map(|(pending, stored)| RecordedEvent {
                sequence_number: stored.sequence_number,
                etag: stored.etag.clone(),
                event: HistoricalEvent::Typed(pending.into_parts().1),
            })
            .collect();
        aggregate.mark_committed(recorded);

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %id,
            events = committed.len(),
            version = aggregate.version(),
            "saved aggregate"
        );

        for stored in &committed {
            if let Err(e) = self.bus.publish(stored.to_envelope()).await {
                tracing::error!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    aggregate_id = %id,
                    sequence_number = stored.sequence_number,
                    event_type = %stored.event_type,
                    error = %e,
                    "failed to publish committed event"
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<A, S> MigratableRepository<A> for EventStoreRepository<A, S>
where
    A: EventSourced,
    S: EventStore,
{
    async fn rename_events(&self, id: AggregateId, renames: &[Rename]) -> Result<(), RepositoryError> {
        self.store.rename_events(id, renames)?;
        Ok(())
    }
}

fn validate_loaded_stream(aggregate_id: AggregateId, stream: &[StoredEvent]) -> Result<(), RepositoryError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(RepositoryError::CorruptStream(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(RepositoryError::CorruptStream(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn resolve<E: EventSchema>(stored: StoredEvent) -> Result<RecordedEvent<E>, RepositoryError> {
    let event = match E::from_payload(&stored.event_type, stored.payload.clone()) {
        Some(Ok(typed)) => HistoricalEvent::Typed(typed),
        Some(Err(e)) => {
            return Err(RepositoryError::Deserialize {
                event_type: stored.event_type,
                sequence_number: stored.sequence_number,
                message: e.to_string(),
            });
        }
        None => HistoricalEvent::Anonymous(AnonymousEvent {
            event_type: stored.event_type,
            payload: stored.payload,
        }),
    };

    Ok(RecordedEvent {
        sequence_number: stored.sequence_number,
        etag: stored.etag,
        event,
    })
}
