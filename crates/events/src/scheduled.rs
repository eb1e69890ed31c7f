//! The scheduled-command entity.
//!
//! A `ScheduledCommand` is a command addressed to one aggregate, to be applied
//! now, at a due time, or once some other event has been committed. It is a
//! plain value: the scheduler stores it, the delivery executor sets its result,
//! and a retry supersedes it with a fresh pending copy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chronicle_core::{AggregateId, Clock, DomainError, ETag};

use crate::sourced::{EventSourced, Sourced};

/// The command carried by a `ScheduledCommand`.
///
/// A construction command creates its target: delivering it to an aggregate
/// that has no events yet is expected, while an ordinary command requires the
/// aggregate to exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "command", rename_all = "snake_case")]
pub enum CommandBody<C> {
    Ordinary(C),
    Construction(C),
}

impl<C> CommandBody<C> {
    pub fn command(&self) -> &C {
        match self {
            CommandBody::Ordinary(command) | CommandBody::Construction(command) => command,
        }
    }

    pub fn into_command(self) -> C {
        match self {
            CommandBody::Ordinary(command) | CommandBody::Construction(command) => command,
        }
    }

    pub fn is_construction(&self) -> bool {
        matches!(self, CommandBody::Construction(_))
    }
}

/// The event a scheduled command waits for before it may be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryPrecondition {
    pub aggregate_id: AggregateId,
    pub etag: ETag,
}

impl DeliveryPrecondition {
    pub fn new(aggregate_id: AggregateId, etag: ETag) -> Self {
        Self { aggregate_id, etag }
    }
}

impl core::fmt::Display for DeliveryPrecondition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "event {} on aggregate {}", self.etag, self.aggregate_id)
    }
}

/// Why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DeliveryError {
    #[error("delivery precondition not met: {0}")]
    PreconditionNotMet(DeliveryPrecondition),

    #[error("{0}")]
    Concurrency(String),

    #[error(transparent)]
    Domain(DomainError),

    #[error("repository error: {0}")]
    Repository(String),
}

impl DeliveryError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, DeliveryError::Concurrency(_))
    }
}

impl From<DomainError> for DeliveryError {
    fn from(value: DomainError) -> Self {
        DeliveryError::Domain(value)
    }
}

/// A failed delivery attempt.
///
/// `retry_after` is set at most once; whichever of a failure handler or the
/// retry policy sets it first wins. A canceled failure is never retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFailed {
    error: DeliveryError,
    number_of_previous_attempts: u32,
    retry_after: Option<Duration>,
    canceled: bool,
}

impl CommandFailed {
    pub fn new(error: DeliveryError, number_of_previous_attempts: u32) -> Self {
        Self {
            error,
            number_of_previous_attempts,
            retry_after: None,
            canceled: false,
        }
    }

    pub fn error(&self) -> &DeliveryError {
        &self.error
    }

    /// Attempts made so far, including the one that produced this failure.
    pub fn number_of_previous_attempts(&self) -> u32 {
        self.number_of_previous_attempts
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn will_be_retried(&self) -> bool {
        !self.canceled && self.retry_after.is_some()
    }

    /// Give up on this command permanently.
    pub fn cancel(&mut self) {
        self.canceled = true;
        self.retry_after = None;
    }

    /// Ask for another attempt after `after`.
    ///
    /// Returns `false` (and changes nothing) when the failure is canceled or a
    /// retry delay was already chosen.
    pub fn retry(&mut self, after: Duration) -> bool {
        if self.canceled || self.retry_after.is_some() {
            return false;
        }
        self.retry_after = Some(after);
        true
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSucceeded;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CommandResult {
    Succeeded(CommandSucceeded),
    Failed(CommandFailed),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCommand<C> {
    etag: ETag,
    aggregate_id: AggregateId,
    command: CommandBody<C>,
    due_time: Option<DateTime<Utc>>,
    delivery_precondition: Option<DeliveryPrecondition>,
    result: Option<CommandResult>,
    number_of_previous_attempts: u32,
}

impl<C> ScheduledCommand<C> {
    /// A pending command, due immediately, with a fresh etag.
    pub fn new(aggregate_id: AggregateId, command: CommandBody<C>) -> Self {
        Self {
            etag: ETag::generate(),
            aggregate_id,
            command,
            due_time: None,
            delivery_precondition: None,
            result: None,
            number_of_previous_attempts: 0,
        }
    }

    pub fn due_at(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }

    pub fn with_due_time(mut self, due_time: Option<DateTime<Utc>>) -> Self {
        self.due_time = due_time;
        self
    }

    pub fn depends_on(mut self, precondition: DeliveryPrecondition) -> Self {
        self.delivery_precondition = Some(precondition);
        self
    }

    pub fn etag(&self) -> &ETag {
        &self.etag
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn body(&self) -> &CommandBody<C> {
        &self.command
    }

    pub fn command(&self) -> &C {
        self.command.command()
    }

    pub fn is_construction(&self) -> bool {
        self.command.is_construction()
    }

    pub fn due_time(&self) -> Option<DateTime<Utc>> {
        self.due_time
    }

    pub fn delivery_precondition(&self) -> Option<&DeliveryPrecondition> {
        self.delivery_precondition.as_ref()
    }

    pub fn result(&self) -> Option<&CommandResult> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, result: CommandResult) {
        self.result = Some(result);
    }

    pub fn number_of_previous_attempts(&self) -> u32 {
        self.number_of_previous_attempts
    }

    pub fn is_pending(&self) -> bool {
        self.result.is_none()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.result, Some(CommandResult::Succeeded(_)))
    }

    pub fn failure(&self) -> Option<&CommandFailed> {
        match &self.result {
            Some(CommandResult::Failed(failed)) => Some(failed),
            _ => None,
        }
    }

    pub fn is_due(&self, clock: &dyn Clock) -> bool {
        self.is_due_at(clock.now())
    }

    /// Due iff no result yet and the due time (if any) is not in the future.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        if self.result.is_some() {
            return false;
        }
        match self.due_time {
            None => true,
            Some(due) => due <= now,
        }
    }
}

impl<C: Clone> ScheduledCommand<C> {
    /// The pending copy that supersedes a retryable failure.
    ///
    /// Same etag (so it replaces the failed state in a store), due
    /// `now + retry_after`, attempt count carried over. `None` when the
    /// command did not fail or will not be retried.
    pub fn next_attempt(&self, now: DateTime<Utc>) -> Option<Self> {
        let failure = self.failure()?;
        if !failure.will_be_retried() {
            return None;
        }
        let after = failure.retry_after()?;
        let due = chrono::Duration::from_std(after)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Some(Self {
            etag: self.etag.clone(),
            aggregate_id: self.aggregate_id,
            command: self.command.clone(),
            due_time: Some(due),
            delivery_precondition: self.delivery_precondition.clone(),
            result: None,
            number_of_previous_attempts: failure.number_of_previous_attempts(),
        })
    }
}

/// An event that a scheduled command can depend on.
///
/// Implemented by committed envelopes and by events still pending on an
/// aggregate, so a command can be made to wait for an event raised in the same
/// unit of work.
pub trait DependencyEvent: Send {
    fn aggregate_id(&self) -> AggregateId;

    fn etag(&self) -> Option<&ETag>;

    fn set_etag(&mut self, etag: ETag);
}

/// Reacts to a failed delivery of one command type on one aggregate type.
///
/// The handler may record events on the aggregate (they are saved unless the
/// failure was a concurrency conflict) and may cancel or retry the failure.
pub trait ScheduledCommandFailureHandler<A: EventSourced>: Send + Sync {
    fn handle_scheduled_command_failure(
        &self,
        aggregate: &mut Sourced<A>,
        command: &A::Command,
        failure: &mut CommandFailed,
    );
}

impl<A, F> ScheduledCommandFailureHandler<A> for F
where
    A: EventSourced,
    F: Fn(&mut Sourced<A>, &A::Command, &mut CommandFailed) + Send + Sync,
{
    fn handle_scheduled_command_failure(
        &self,
        aggregate: &mut Sourced<A>,
        command: &A::Command,
        failure: &mut CommandFailed,
    ) {
        self(aggregate, command, failure)
    }
}
