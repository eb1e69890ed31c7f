use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use chronicle_core::{AggregateId, ETag, ExpectedVersion};
use chronicle_events::{EventEnvelope, EventSchema};
use std::sync::Arc;

use crate::migration::Rename;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: created by the aggregate's `handle()` (or recorded by a failure handler)
/// 2. **UncommittedEvent**: wrapped with stream metadata and an etag
/// 3. **StoredEvent**: persisted with an assigned `sequence_number`
/// 4. **EventEnvelope**: published to the event bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub etag: ETag,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are assigned by the store during append: 1-based,
/// monotonically increasing per stream, never reused.
///
/// The `event_type` is the only stored field a migration may rewrite; replay
/// resolves the payload against whatever type name is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub etag: ETag,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into an envelope for publication.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.payload.clone(),
        )
        .with_etag(self.etag.clone())
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error(
        "Migration failed, because no event with sequence number {sequence_number} on aggregate {aggregate_id} was found."
    )]
    SequenceNumberNotFound {
        sequence_number: u64,
        aggregate_id: AggregateId,
    },

    #[error("event store lock poisoned")]
    Poisoned,
}

/// Append-only event store.
///
/// Events are organized into **streams**, one per aggregate instance. Within a
/// stream, events have sequence numbers 1, 2, 3, ...
///
/// `append()`:
/// - validates that all events target the same aggregate and aggregate type
/// - checks optimistic concurrency (`ExpectedVersion`)
/// - assigns sequence numbers starting at `current_version + 1`
/// - persists the batch atomically
///
/// `load_stream()` returns the stream in sequence order, or an empty vector for
/// an aggregate that has no events yet.
///
/// `rename_events()` is the one sanctioned rewrite: it changes the stored type
/// name of existing events, leaving payloads and positions untouched. Either
/// every rename applies or none does.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for an aggregate.
    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn rename_events(&self, aggregate_id: AggregateId, renames: &[Rename]) -> Result<(), EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(aggregate_id)
    }

    fn rename_events(&self, aggregate_id: AggregateId, renames: &[Rename]) -> Result<(), EventStoreError> {
        (**self).rename_events(aggregate_id, renames)
    }
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed domain event.
    ///
    /// Only the event's data is stored as payload; its type travels in
    /// `event_type` so a later rename can reinterpret the same payload.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        etag: ETag,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: EventSchema,
    {
        let payload = event
            .to_payload()
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            etag,
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
