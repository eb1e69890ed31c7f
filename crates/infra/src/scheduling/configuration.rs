//! Per-aggregate scheduling composition root.
//!
//! `SchedulingConfiguration<A>` owns everything a scheduler for aggregate `A`
//! needs and resolves schedulers from it. Pipeline registrations are composed
//! at resolution time, so each resolved scheduler sees the registrations made
//! before it was resolved and none made after.
//!
//! The bus subscription and the poller resolve a scheduler for every event
//! and every tick, so registrations made after either was started still
//! apply to them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use chronicle_core::Clock;
use chronicle_events::{
    EventEnvelope, EventHandler, EventHandlingError, EventSourced, HandlerId, ScheduledCommand,
    ScheduledCommandFailureHandler, UndeserializableEvent,
};

use super::delivery::{AuthorizationPolicy, DeliveryExecutor, FailureHandlers};
use super::pipeline::{CommandSchedulerPipeline, Interceptor, Next, SchedulingResult};
use super::poller::{DueCommandPoller, DueCommandPollerHandle};
use super::precondition::PreconditionVerifier;
use super::retry::RetryPolicy;
use super::scheduler::CommandScheduler;
use super::settings::SchedulerSettings;
use super::store::{InMemoryScheduledCommandStore, ScheduledCommandStore};
use crate::repository::{EventSourcedRepository, SharedEventBus};

/// Registrations that may change after schedulers have been handed out.
struct Registrations<A: EventSourced> {
    pipeline: CommandSchedulerPipeline<A::Command>,
    failure_handlers: FailureHandlers<A>,
    authorization: AuthorizationPolicy<A>,
    retry_policy: RetryPolicy,
}

/// Resolves schedulers from a configuration's current registrations.
///
/// Cheap to clone and shares the registrations with the configuration it came
/// from.
pub struct SchedulerResolver<A: EventSourced> {
    repository: Arc<dyn EventSourcedRepository<A>>,
    bus: SharedEventBus,
    clock: Arc<dyn Clock>,
    store: Arc<dyn ScheduledCommandStore<A::Command>>,
    verifier: Arc<dyn PreconditionVerifier>,
    registrations: Arc<RwLock<Registrations<A>>>,
    settings: SchedulerSettings,
}

impl<A: EventSourced> Clone for SchedulerResolver<A> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            bus: Arc::clone(&self.bus),
            clock: Arc::clone(&self.clock),
            store: Arc::clone(&self.store),
            verifier: Arc::clone(&self.verifier),
            registrations: Arc::clone(&self.registrations),
            settings: self.settings.clone(),
        }
    }
}

impl<A: EventSourced> SchedulerResolver<A> {
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// A scheduler with pipelines composed from the registrations as they are now.
    pub fn resolve(&self) -> CommandScheduler<A> {
        let registrations = self.registrations.read().unwrap_or_else(PoisonError::into_inner);
        let (schedule_chain, deliver_chain) = registrations.pipeline.compose();
        let executor = DeliveryExecutor::new(Arc::clone(&self.repository), Arc::clone(&self.verifier))
            .with_failure_handlers(registrations.failure_handlers.clone())
            .with_authorization(registrations.authorization.clone())
            .with_retry_policy(registrations.retry_policy.clone());

        CommandScheduler::new(
            executor,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&self.bus),
            Arc::clone(&self.verifier),
            schedule_chain,
            deliver_chain,
            self.settings.clone(),
        )
    }
}

pub struct SchedulingConfiguration<A: EventSourced> {
    resolver: SchedulerResolver<A>,
}

impl<A: EventSourced> core::fmt::Debug for SchedulingConfiguration<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let registrations = self.registrations().read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SchedulingConfiguration")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("pipeline", &registrations.pipeline)
            .field("failure_handlers", &registrations.failure_handlers.keys().collect::<Vec<_>>())
            .field("authorization", &registrations.authorization)
            .field("retry_policy", &registrations.retry_policy)
            .field("settings", &self.resolver.settings)
            .finish_non_exhaustive()
    }
}

impl<A: EventSourced> SchedulingConfiguration<A> {
    /// A configuration with an in-memory command store, no interceptors, no
    /// failure handlers and every command authorized.
    pub fn new(
        repository: Arc<dyn EventSourcedRepository<A>>,
        bus: SharedEventBus,
        clock: Arc<dyn Clock>,
        verifier: Arc<dyn PreconditionVerifier>,
    ) -> Self {
        let registrations = Registrations {
            pipeline: CommandSchedulerPipeline::new(),
            failure_handlers: HashMap::new(),
            authorization: AuthorizationPolicy::AllowAll,
            retry_policy: RetryPolicy::default(),
        };
        Self {
            resolver: SchedulerResolver {
                repository,
                bus,
                clock,
                store: Arc::new(InMemoryScheduledCommandStore::<A::Command>::new()),
                verifier,
                registrations: Arc::new(RwLock::new(registrations)),
                settings: SchedulerSettings::default(),
            },
        }
    }

    fn registrations(&self) -> &RwLock<Registrations<A>> {
        &self.resolver.registrations
    }

    fn update(&self, f: impl FnOnce(&mut Registrations<A>)) {
        let mut registrations = self.registrations().write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *registrations);
    }

    pub fn with_store(mut self, store: Arc<dyn ScheduledCommandStore<A::Command>>) -> Self {
        self.resolver.store = store;
        self
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.resolver.settings = settings;
        self
    }

    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        self.update(|r| r.retry_policy = policy);
        self
    }

    pub fn with_authorization(self, policy: AuthorizationPolicy<A>) -> Self {
        self.update(|r| r.authorization = policy);
        self
    }

    /// Register interceptors around scheduling and/or delivery.
    pub fn add_to_command_scheduler_pipeline(
        &mut self,
        schedule: Option<Box<dyn Interceptor<A::Command>>>,
        deliver: Option<Box<dyn Interceptor<A::Command>>>,
    ) -> &mut Self {
        self.update(|r| {
            if let Some(interceptor) = schedule {
                r.pipeline.on_schedule(BoxedInterceptor(interceptor));
            }
            if let Some(interceptor) = deliver {
                r.pipeline.on_deliver(BoxedInterceptor(interceptor));
            }
        });
        self
    }

    /// Edit the interceptor registrations in place.
    pub fn configure_pipeline(&mut self, f: impl FnOnce(&mut CommandSchedulerPipeline<A::Command>)) -> &mut Self {
        self.update(|r| f(&mut r.pipeline));
        self
    }

    /// Handle failed deliveries of commands named `command_name`.
    pub fn on_scheduled_command_failure(
        &mut self,
        command_name: &'static str,
        handler: impl ScheduledCommandFailureHandler<A> + 'static,
    ) -> &mut Self {
        let handler: Arc<dyn ScheduledCommandFailureHandler<A>> = Arc::new(handler);
        self.update(|r| {
            r.failure_handlers.insert(command_name, handler);
        });
        self
    }

    pub fn repository(&self) -> &Arc<dyn EventSourcedRepository<A>> {
        &self.resolver.repository
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.resolver.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.resolver.clock
    }

    pub fn store(&self) -> &Arc<dyn ScheduledCommandStore<A::Command>> {
        &self.resolver.store
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.resolver.settings
    }

    /// A resolver sharing this configuration's registrations.
    pub fn resolver(&self) -> SchedulerResolver<A> {
        self.resolver.clone()
    }

    /// Resolve a scheduler with freshly composed pipelines.
    pub fn command_scheduler(&self) -> CommandScheduler<A> {
        self.resolver.resolve()
    }

    /// Schedule every `A::COMMAND_SCHEDULED_EVENT` published on the bus.
    pub fn subscribe_to_event_bus(&self) -> HandlerId {
        let handler = CommandScheduledHandler {
            name: format!("{}:{}", self.resolver.settings.scheduler_name, A::AGGREGATE_TYPE),
            resolver: self.resolver(),
        };
        self.resolver.bus.register(Arc::new(handler))
    }

    /// Start a poller delivering due commands every `settings.poll_interval`.
    pub fn spawn_poller(&self) -> DueCommandPollerHandle {
        DueCommandPoller::new(self.resolver(), self.resolver.settings.poll_interval).spawn()
    }
}

struct BoxedInterceptor<C>(Box<dyn Interceptor<C>>);

#[async_trait]
impl<C: Send + 'static> Interceptor<C> for BoxedInterceptor<C> {
    async fn intercept(&self, command: ScheduledCommand<C>, next: Next<C>) -> SchedulingResult<C> {
        self.0.intercept(command, next).await
    }
}

/// Hands `CommandScheduled` events to a freshly resolved scheduler.
struct CommandScheduledHandler<A: EventSourced> {
    name: String,
    resolver: SchedulerResolver<A>,
}

#[async_trait]
impl<A: EventSourced> EventHandler<EventEnvelope<JsonValue>> for CommandScheduledHandler<A> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), EventHandlingError> {
        if envelope.event_type() != A::COMMAND_SCHEDULED_EVENT {
            return Ok(());
        }

        let scheduled: ScheduledCommand<A::Command> = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| {
                EventHandlingError::new(&self.name, format!("malformed scheduled command: {e}"))
                    .for_aggregate(envelope.aggregate_id())
                    .with_undeserializable(UndeserializableEvent {
                        stream_name: envelope.aggregate_type().to_string(),
                        event_type: envelope.event_type().to_string(),
                        sequence_number: envelope.sequence_number(),
                        body: envelope.payload().to_string(),
                    })
            })?;

        self.resolver
            .resolve()
            .schedule_command(scheduled)
            .await
            .map(|_| ())
            .map_err(|e| EventHandlingError::new(&self.name, e.to_string()).for_aggregate(envelope.aggregate_id()))
    }
}
