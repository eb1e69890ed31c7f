//! Applying scheduled commands to their aggregates.
//!
//! ```text
//! ScheduledCommand
//!   ↓
//! 1. Already has a result? → done
//!   ↓
//! 2. Precondition satisfied? (no → PreconditionNotMet)
//!   ↓
//! 3. Load aggregate (absent: construct, or fail with a concurrency error)
//!   ↓
//! 4. Authorize, apply command, save → CommandSucceeded
//!   ↓ (any failure)
//! 5. Failure handler, save its events, cancel or schedule a retry → CommandFailed
//! ```
//!
//! Delivery never returns an error. Every failure ends up in the command's
//! result, so one command's failure cannot affect another's delivery.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use chronicle_core::DomainError;
use chronicle_events::{
    Command, CommandFailed, CommandResult, CommandSucceeded, DeliveryError, EventSourced,
    ScheduledCommand, ScheduledCommandFailureHandler, Sourced,
};

use super::precondition::PreconditionVerifier;
use super::retry::RetryPolicy;
use crate::repository::{EventSourcedRepository, RepositoryError};

/// Decides whether a command may be applied to an aggregate.
pub enum AuthorizationPolicy<A: EventSourced> {
    AllowAll,
    Predicate(Arc<dyn Fn(&Sourced<A>, &A::Command) -> bool + Send + Sync>),
}

impl<A: EventSourced> AuthorizationPolicy<A> {
    pub fn predicate(f: impl Fn(&Sourced<A>, &A::Command) -> bool + Send + Sync + 'static) -> Self {
        AuthorizationPolicy::Predicate(Arc::new(f))
    }

    pub fn allows(&self, aggregate: &Sourced<A>, command: &A::Command) -> bool {
        match self {
            AuthorizationPolicy::AllowAll => true,
            AuthorizationPolicy::Predicate(f) => f(aggregate, command),
        }
    }
}

impl<A: EventSourced> Default for AuthorizationPolicy<A> {
    fn default() -> Self {
        AuthorizationPolicy::AllowAll
    }
}

impl<A: EventSourced> Clone for AuthorizationPolicy<A> {
    fn clone(&self) -> Self {
        match self {
            AuthorizationPolicy::AllowAll => AuthorizationPolicy::AllowAll,
            AuthorizationPolicy::Predicate(f) => AuthorizationPolicy::Predicate(Arc::clone(f)),
        }
    }
}

impl<A: EventSourced> core::fmt::Debug for AuthorizationPolicy<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AuthorizationPolicy::AllowAll => f.write_str("AllowAll"),
            AuthorizationPolicy::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Failure handlers keyed by command name.
pub type FailureHandlers<A> = HashMap<&'static str, Arc<dyn ScheduledCommandFailureHandler<A>>>;

pub struct DeliveryExecutor<A: EventSourced> {
    repository: Arc<dyn EventSourcedRepository<A>>,
    verifier: Arc<dyn PreconditionVerifier>,
    failure_handlers: Arc<FailureHandlers<A>>,
    authorization: AuthorizationPolicy<A>,
    retry_policy: RetryPolicy,
}

impl<A: EventSourced> Clone for DeliveryExecutor<A> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            verifier: Arc::clone(&self.verifier),
            failure_handlers: Arc::clone(&self.failure_handlers),
            authorization: self.authorization.clone(),
            retry_policy: self.retry_policy.clone(),
        }
    }
}

impl<A: EventSourced> core::fmt::Debug for DeliveryExecutor<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeliveryExecutor")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("failure_handlers", &self.failure_handlers.keys().collect::<Vec<_>>())
            .field("authorization", &self.authorization)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl<A: EventSourced> DeliveryExecutor<A> {
    pub fn new(
        repository: Arc<dyn EventSourcedRepository<A>>,
        verifier: Arc<dyn PreconditionVerifier>,
    ) -> Self {
        Self {
            repository,
            verifier,
            failure_handlers: Arc::new(HashMap::new()),
            authorization: AuthorizationPolicy::AllowAll,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_failure_handlers(mut self, handlers: FailureHandlers<A>) -> Self {
        self.failure_handlers = Arc::new(handlers);
        self
    }

    pub fn with_authorization(mut self, policy: AuthorizationPolicy<A>) -> Self {
        self.authorization = policy;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Apply the command and record the outcome on it.
    pub async fn deliver(&self, scheduled: &mut ScheduledCommand<A::Command>) {
        if scheduled.result().is_some() {
            return;
        }

        // The aggregate as it was before the command was applied.
        let mut target: Option<Sourced<A>> = None;

        match self.attempt(scheduled, &mut target).await {
            Ok(()) => {
                info!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    aggregate_id = %scheduled.aggregate_id(),
                    command = scheduled.command().command_name(),
                    etag = %scheduled.etag(),
                    "scheduled command delivered"
                );
                scheduled.set_result(CommandResult::Succeeded(CommandSucceeded));
            }
            Err(error) => {
                let failure = self.fail(scheduled, error, target).await;
                scheduled.set_result(CommandResult::Failed(failure));
            }
        }
    }

    async fn attempt(
        &self,
        scheduled: &ScheduledCommand<A::Command>,
        target: &mut Option<Sourced<A>>,
    ) -> Result<(), DeliveryError> {
        if let Some(precondition) = scheduled.delivery_precondition() {
            if !self.verifier.is_satisfied(precondition).await {
                return Err(DeliveryError::PreconditionNotMet(precondition.clone()));
            }
        }

        let id = scheduled.aggregate_id();
        let mut aggregate = match self.repository.get_latest(id).await.map_err(delivery_error)? {
            Some(aggregate) => aggregate,
            None if scheduled.is_construction() => Sourced::new(id),
            None => {
                return Err(DeliveryError::Concurrency(format!(
                    "No {} was found with id {} so the command could not be applied.",
                    A::AGGREGATE_TYPE,
                    id
                )));
            }
        };
        *target = Some(aggregate.clone());

        let command = scheduled.command();
        if !self.authorization.allows(&aggregate, command) {
            return Err(DeliveryError::Domain(DomainError::Unauthorized));
        }

        aggregate.apply_command(command)?;
        self.repository.save(&mut aggregate).await.map_err(delivery_error)?;
        Ok(())
    }

    async fn fail(
        &self,
        scheduled: &ScheduledCommand<A::Command>,
        error: DeliveryError,
        target: Option<Sourced<A>>,
    ) -> CommandFailed {
        let command = scheduled.command();
        let previous_attempts = scheduled.number_of_previous_attempts();
        let mut failure = CommandFailed::new(error, previous_attempts + 1);

        if let Some(mut aggregate) = target {
            if let Some(handler) = self.failure_handlers.get(command.command_name()) {
                handler.handle_scheduled_command_failure(&mut aggregate, command, &mut failure);
            }

            if !failure.error().is_concurrency() {
                if let Err(e) = self.repository.save(&mut aggregate).await {
                    warn!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        aggregate_id = %aggregate.id(),
                        error = %e,
                        "failed to save aggregate after scheduled command failure"
                    );
                }
            } else if scheduled.is_construction() {
                failure.cancel();
            }
        }

        if !failure.is_canceled()
            && failure.retry_after().is_none()
            && self.retry_policy.should_retry(previous_attempts)
        {
            failure.retry(self.retry_policy.delay_for_attempt(previous_attempts + 1));
        }

        if failure.will_be_retried() {
            debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                aggregate_id = %scheduled.aggregate_id(),
                command = command.command_name(),
                attempts = failure.number_of_previous_attempts(),
                retry_after_secs = failure.retry_after().map(|d| d.as_secs()),
                error = %failure.error(),
                "scheduled command failed, will retry"
            );
        } else {
            warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                aggregate_id = %scheduled.aggregate_id(),
                command = command.command_name(),
                attempts = failure.number_of_previous_attempts(),
                canceled = failure.is_canceled(),
                error = %failure.error(),
                "scheduled command failed"
            );
        }

        failure
    }
}

fn delivery_error(error: RepositoryError) -> DeliveryError {
    match error {
        RepositoryError::Concurrency(msg) => DeliveryError::Concurrency(msg),
        other => DeliveryError::Repository(other.to_string()),
    }
}
