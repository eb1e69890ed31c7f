//! Delivery preconditions.
//!
//! A scheduled command may depend on another event (identified by aggregate id
//! and etag). The verifier answers "has it happened yet?" at delivery time; the
//! watcher waits on the bus for it to happen and delivers as soon as it does.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chronicle_events::{DeliveryPrecondition, EventHandlingError, EventSourced, ScheduledCommand};

use super::scheduler::CommandScheduler;
use crate::event_store::EventStore;
use crate::repository::SharedEventBus;

#[async_trait]
pub trait PreconditionVerifier: Send + Sync {
    async fn is_satisfied(&self, precondition: &DeliveryPrecondition) -> bool;
}

/// Checks the event store for the referenced event.
#[derive(Debug)]
pub struct EventStorePreconditionVerifier<S> {
    store: S,
}

impl<S> EventStorePreconditionVerifier<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: EventStore> PreconditionVerifier for EventStorePreconditionVerifier<S> {
    async fn is_satisfied(&self, precondition: &DeliveryPrecondition) -> bool {
        match self.store.load_stream(precondition.aggregate_id) {
            Ok(stream) => stream.iter().any(|e| e.etag == precondition.etag),
            Err(e) => {
                warn!(
                    aggregate_id = %precondition.aggregate_id,
                    etag = %precondition.etag,
                    error = %e,
                    "could not verify delivery precondition"
                );
                false
            }
        }
    }
}

/// Deliver `scheduled` once the event it depends on is published, waiting at
/// most `timeout`.
///
/// The subscription is opened before this returns, so an event published
/// right afterwards is not missed. On a match, delivery runs on its own task.
/// On timeout an `EventHandlingError` naming the scheduler is published on the
/// bus's error stream and the command stays pending.
pub fn deliver_if_precondition_is_satisfied_within<A: EventSourced>(
    scheduler: &CommandScheduler<A>,
    timeout: Duration,
    scheduled: ScheduledCommand<A::Command>,
    bus: &SharedEventBus,
) -> JoinHandle<()> {
    let scheduler = scheduler.clone();

    let Some(precondition) = scheduled.delivery_precondition().cloned() else {
        return tokio::spawn(async move {
            deliver(scheduler, scheduled).await;
        });
    };

    let mut subscription = bus.subscribe();
    let bus = SharedEventBus::clone(bus);

    tokio::spawn(async move {
        let waited = tokio::time::timeout(timeout, async {
            while let Some(envelope) = subscription.recv().await {
                if envelope.satisfies(&precondition) {
                    return true;
                }
            }
            false
        })
        .await;
        drop(subscription);

        match waited {
            Ok(true) => {
                debug!(
                    scheduler = scheduler.name(),
                    etag = %scheduled.etag(),
                    precondition = %precondition,
                    "delivery precondition satisfied"
                );
                tokio::spawn(deliver(scheduler, scheduled));
            }
            Ok(false) => {
                warn!(
                    scheduler = scheduler.name(),
                    etag = %scheduled.etag(),
                    "event bus closed while waiting for delivery precondition"
                );
            }
            Err(_) => {
                warn!(
                    scheduler = scheduler.name(),
                    etag = %scheduled.etag(),
                    precondition = %precondition,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for delivery precondition"
                );
                bus.publish_error(
                    EventHandlingError::new(
                        scheduler.name(),
                        format!(
                            "timed out after {timeout:?} waiting for {precondition} before delivering scheduled command {}",
                            scheduled.etag()
                        ),
                    )
                    .for_aggregate(scheduled.aggregate_id()),
                );
            }
        }
    })
}

async fn deliver<A: EventSourced>(scheduler: CommandScheduler<A>, scheduled: ScheduledCommand<A::Command>) {
    if let Err(e) = scheduler.deliver(scheduled).await {
        warn!(scheduler = scheduler.name(), error = %e, "deferred delivery failed");
    }
}
