use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chronicle_core::{AggregateId, ETag};

use crate::scheduled::{DeliveryPrecondition, DependencyEvent};

/// Envelope for an event, containing stream metadata.
///
/// This is the unit published on the event bus after a successful append.
///
/// Notes:
/// - **Append-only**: `sequence_number` is monotonically increasing per stream.
/// - `etag` identifies this exact occurrence; committed events always carry one.
/// - `payload` is the domain-agnostic event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    sequence_number: u64,

    event_type: String,
    etag: Option<ETag>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        event_type: impl Into<String>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            event_type: event_type.into(),
            etag: None,
            payload,
        }
    }

    pub fn with_etag(mut self, etag: ETag) -> Self {
        self.etag = Some(etag);
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Whether this is the event a delivery precondition waits for.
    pub fn satisfies(&self, precondition: &DeliveryPrecondition) -> bool {
        self.aggregate_id == precondition.aggregate_id
            && self.etag.as_ref() == Some(&precondition.etag)
    }
}

impl<E: Send> DependencyEvent for EventEnvelope<E> {
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
