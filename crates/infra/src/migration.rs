//! Event migration by renaming.
//!
//! When an event type is split, renamed, or retired, past occurrences can be
//! re-labelled in place. The payload is untouched; on the next load the
//! repository resolves it against the new type name, or keeps it as an
//! anonymous placeholder if the aggregate does not know that name.

use thiserror::Error;

use chronicle_core::AggregateId;
use chronicle_events::{EventSourced, Sourced};

use crate::event_store::EventStoreError;
use crate::repository::{MigratableRepository, RepositoryError};

/// Re-label the event at `sequence_number` as `new_event_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub sequence_number: u64,
    pub new_event_type: String,
}

impl Rename {
    pub fn new(sequence_number: u64, new_event_type: impl Into<String>) -> Self {
        Self {
            sequence_number,
            new_event_type: new_event_type.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(
        "Migration failed, because no event with sequence number {sequence_number} on aggregate {aggregate_id} was found."
    )]
    SequenceNumberNotFound {
        sequence_number: u64,
        aggregate_id: AggregateId,
    },

    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for MigrationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Store(EventStoreError::SequenceNumberNotFound {
                sequence_number,
                aggregate_id,
            }) => MigrationError::SequenceNumberNotFound {
                sequence_number,
                aggregate_id,
            },
            other => MigrationError::Repository(other),
        }
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct EventMigrator;

impl EventMigrator {
    /// Apply `renames` to the aggregate's stored history, then save its pending
    /// events.
    ///
    /// Every rename is validated before any is applied; an unknown sequence
    /// number fails the whole migration and leaves the stream unchanged.
    pub async fn save_with_renames<A, R>(
        repository: &R,
        aggregate: &mut Sourced<A>,
        renames: &[Rename],
    ) -> Result<(), MigrationError>
    where
        A: EventSourced,
        R: MigratableRepository<A> + ?Sized,
    {
        let aggregate_id = aggregate.id();
        repository.rename_events(aggregate_id, renames).await?;

        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %aggregate_id,
            renames = renames.len(),
            "renamed stored events"
        );

        repository.save(aggregate).await?;
        Ok(())
    }
}
