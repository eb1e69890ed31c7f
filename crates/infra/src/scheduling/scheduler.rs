//! The command scheduler: schedule and deliver.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use chronicle_core::{AggregateId, Clock, ETag};
use chronicle_events::{
    Command, CommandBody, DeliveryPrecondition, DependencyEvent, EventSourced, ScheduledCommand,
};

use super::delivery::DeliveryExecutor;
use super::pipeline::{ComposedChain, SchedulingResult, Terminal};
use super::precondition::{PreconditionVerifier, deliver_if_precondition_is_satisfied_within};
use super::settings::SchedulerSettings;
use super::store::{ScheduledCommandStore, ScheduledCommandStoreError};
use crate::repository::SharedEventBus;

#[derive(Debug, Error)]
pub enum SchedulingError {
    /// The request was malformed (e.g. an empty aggregate id).
    #[error("{0}")]
    Argument(String),

    /// An interceptor refused the command.
    #[error("scheduled command rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] ScheduledCommandStoreError),
}

/// Outcome counts of one `deliver_due` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Commands whose delivery pipeline itself returned an error.
    pub errored: usize,
}

/// Schedules commands against aggregates of type `A` and delivers them.
///
/// Cheap to clone; clones share the same store, clock and composed pipelines.
pub struct CommandScheduler<A: EventSourced> {
    inner: Arc<SchedulerInner<A>>,
}

struct SchedulerInner<A: EventSourced> {
    executor: DeliveryExecutor<A>,
    store: Arc<dyn ScheduledCommandStore<A::Command>>,
    clock: Arc<dyn Clock>,
    bus: SharedEventBus,
    verifier: Arc<dyn PreconditionVerifier>,
    schedule_chain: ComposedChain<A::Command>,
    deliver_chain: ComposedChain<A::Command>,
    settings: SchedulerSettings,
}

impl<A: EventSourced> Clone for CommandScheduler<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: EventSourced> core::fmt::Debug for CommandScheduler<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandScheduler")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("schedule_chain", &self.inner.schedule_chain)
            .field("deliver_chain", &self.inner.deliver_chain)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl<A: EventSourced> CommandScheduler<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: DeliveryExecutor<A>,
        store: Arc<dyn ScheduledCommandStore<A::Command>>,
        clock: Arc<dyn Clock>,
        bus: SharedEventBus,
        verifier: Arc<dyn PreconditionVerifier>,
        schedule_chain: ComposedChain<A::Command>,
        deliver_chain: ComposedChain<A::Command>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                store,
                clock,
                bus,
                verifier,
                schedule_chain,
                deliver_chain,
                settings,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.scheduler_name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn store(&self) -> &Arc<dyn ScheduledCommandStore<A::Command>> {
        &self.inner.store
    }

    /// Schedule `command` for the aggregate `aggregate_id`.
    ///
    /// With no `due_time` the command is due immediately. With
    /// `delivery_depends_on`, delivery waits until that event has been
    /// committed; an etag is assigned to the event if it has none yet.
    ///
    /// A command that is due and not blocked is delivered before this returns.
    pub async fn schedule(
        &self,
        aggregate_id: AggregateId,
        command: CommandBody<A::Command>,
        due_time: Option<DateTime<Utc>>,
        delivery_depends_on: Option<&mut dyn DependencyEvent>,
    ) -> SchedulingResult<A::Command> {
        if aggregate_id.is_nil() {
            return Err(SchedulingError::Argument("aggregate_id cannot be empty".to_string()));
        }

        let mut scheduled = ScheduledCommand::new(aggregate_id, command).with_due_time(due_time);

        if let Some(event) = delivery_depends_on {
            if event.aggregate_id().is_nil() {
                return Err(missing_dependency_aggregate());
            }
            let etag = match event.etag().cloned() {
                Some(etag) => etag,
                None => {
                    let etag = ETag::generate();
                    event.set_etag(etag.clone());
                    etag
                }
            };
            scheduled = scheduled.depends_on(DeliveryPrecondition::new(event.aggregate_id(), etag));
        }

        self.schedule_command(scheduled).await
    }

    /// Schedule an already-built command (e.g. one raised by an aggregate).
    pub async fn schedule_command(
        &self,
        scheduled: ScheduledCommand<A::Command>,
    ) -> SchedulingResult<A::Command> {
        if scheduled.aggregate_id().is_nil() {
            return Err(SchedulingError::Argument("aggregate_id cannot be empty".to_string()));
        }
        if let Some(precondition) = scheduled.delivery_precondition() {
            if precondition.aggregate_id.is_nil() {
                return Err(missing_dependency_aggregate());
            }
        }

        let scheduler = self.clone();
        let terminal: Terminal<A::Command> = Arc::new(move |scheduled| {
            let scheduler = scheduler.clone();
            Box::pin(async move { scheduler.enqueue(scheduled).await })
        });

        self.inner.schedule_chain.run(scheduled, terminal).await
    }

    /// Record the command and deliver it now if nothing holds it back.
    async fn enqueue(&self, scheduled: ScheduledCommand<A::Command>) -> SchedulingResult<A::Command> {
        if !self.inner.store.record(&scheduled)? {
            debug!(
                scheduler = self.name(),
                etag = %scheduled.etag(),
                "command already scheduled"
            );
            return Ok(self.inner.store.get(scheduled.etag())?.unwrap_or(scheduled));
        }

        info!(
            scheduler = self.name(),
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %scheduled.aggregate_id(),
            command = scheduled.command().command_name(),
            etag = %scheduled.etag(),
            due_time = ?scheduled.due_time(),
            "command scheduled"
        );

        if !scheduled.is_due(self.inner.clock.as_ref()) {
            return Ok(scheduled);
        }

        match scheduled.delivery_precondition() {
            None => self.deliver(scheduled).await,
            Some(precondition) => {
                let watcher = deliver_if_precondition_is_satisfied_within(
                    self,
                    self.inner.settings.precondition_timeout,
                    scheduled.clone(),
                    &self.inner.bus,
                );
                if self.inner.verifier.is_satisfied(precondition).await {
                    watcher.abort();
                    self.deliver(scheduled).await
                } else {
                    debug!(
                        scheduler = self.name(),
                        etag = %scheduled.etag(),
                        precondition = %precondition,
                        "waiting for delivery precondition"
                    );
                    Ok(scheduled)
                }
            }
        }
    }

    /// Deliver the command through the deliver pipeline.
    ///
    /// A no-op (returning the latest known state) when the command already has
    /// a result or another delivery of it is in progress.
    pub async fn deliver(&self, scheduled: ScheduledCommand<A::Command>) -> SchedulingResult<A::Command> {
        if scheduled.result().is_some() {
            return Ok(scheduled);
        }

        let claimed = match self.inner.store.claim(scheduled.etag())? {
            Some(claimed) => claimed,
            None => match self.inner.store.get(scheduled.etag())? {
                Some(stored) => {
                    debug!(
                        scheduler = self.name(),
                        etag = %scheduled.etag(),
                        "scheduled command already delivered or in flight"
                    );
                    return Ok(stored);
                }
                None => {
                    // Never recorded here; take ownership of it.
                    self.inner.store.record(&scheduled)?;
                    match self.inner.store.claim(scheduled.etag())? {
                        Some(claimed) => claimed,
                        None => return Ok(scheduled),
                    }
                }
            },
        };

        self.deliver_claimed(claimed).await
    }

    async fn deliver_claimed(&self, claimed: ScheduledCommand<A::Command>) -> SchedulingResult<A::Command> {
        let etag = claimed.etag().clone();

        let executor = self.inner.executor.clone();
        let terminal: Terminal<A::Command> = Arc::new(move |mut scheduled| {
            let executor = executor.clone();
            Box::pin(async move {
                executor.deliver(&mut scheduled).await;
                Ok(scheduled)
            })
        });

        let delivered = match self.inner.deliver_chain.run(claimed, terminal).await {
            Ok(delivered) => delivered,
            Err(e) => {
                self.inner.store.release(&etag)?;
                return Err(e);
            }
        };

        if delivered.is_pending() {
            // An interceptor skipped delivery; leave it for a later attempt.
            self.inner.store.release(&etag)?;
            return Ok(delivered);
        }

        self.inner.store.complete(&delivered)?;
        if let Some(next) = delivered.next_attempt(self.inner.clock.now()) {
            self.inner.store.supersede(&next)?;
        }

        Ok(delivered)
    }

    /// Deliver every command that is due, each independently.
    pub async fn deliver_due(&self) -> Result<DeliveryReport, SchedulingError> {
        let due = self.inner.store.claim_due(self.inner.clock.now())?;
        let mut report = DeliveryReport::default();

        for scheduled in due {
            let etag = scheduled.etag().clone();
            match self.deliver_claimed(scheduled).await {
                Ok(delivered) if delivered.succeeded() => {
                    report.delivered += 1;
                    report.succeeded += 1;
                }
                Ok(delivered) if delivered.failure().is_some() => {
                    report.delivered += 1;
                    report.failed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(scheduler = self.name(), etag = %etag, error = %e, "scheduled command delivery errored");
                    report.errored += 1;
                }
            }
        }

        if report.delivered > 0 || report.errored > 0 {
            info!(
                scheduler = self.name(),
                delivered = report.delivered,
                succeeded = report.succeeded,
                failed = report.failed,
                errored = report.errored,
                "delivered due commands"
            );
        }

        Ok(report)
    }
}

fn missing_dependency_aggregate() -> SchedulingError {
    SchedulingError::Argument(
        "An AggregateId must be set on the event on which the scheduled command depends.".to_string(),
    )
}
