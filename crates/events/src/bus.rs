//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes committed events to two kinds of consumers:
//!
//! - **Registered handlers** run as part of `publish` and are awaited before it
//!   returns. The command scheduler uses this to pick up `CommandScheduled`
//!   events the moment the aggregate that raised them is saved.
//! - **Subscriptions** receive a copy of every message published after they were
//!   opened. Precondition watchers use these to wait for a specific event.
//!
//! Events are stored first and published second, so a failed publish never loses
//! an event. Consumers must be idempotent.
//!
//! Handler failures do not fail the publish. They are reported on a separate
//! error stream (`publish_error` / `errors`) that anyone can observe.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use chronicle_core::AggregateId;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,

    /// Publish failed due to internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
}

/// A subscription to the bus.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics). A slow subscriber that falls behind skips the
/// messages it missed rather than blocking publishers.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: broadcast::Receiver<M>,
}

impl<M: Clone> Subscription<M> {
    pub fn new(receiver: broadcast::Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscription lagged behind the event bus");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Identifies a registered handler so it can be removed again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// A handler awaited for every published message.
#[async_trait]
pub trait EventHandler<M>: Send + Sync {
    /// Name used when reporting failures.
    fn name(&self) -> &str;

    async fn handle(&self, message: &M) -> Result<(), EventHandlingError>;
}

/// A failure raised while reacting to an event, published on the bus's error
/// stream rather than propagated to the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{handler} failed: {message}")]
pub struct EventHandlingError {
    pub handler: String,
    pub message: String,
    pub aggregate_id: Option<AggregateId>,
    /// Set when the handler could not deserialize the event it was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undeserializable: Option<UndeserializableEvent>,
}

/// An event exactly as it reached a handler that could not read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndeserializableEvent {
    /// The aggregate type whose stream the event belongs to.
    pub stream_name: String,
    pub event_type: String,
    pub sequence_number: u64,
    pub body: String,
}

impl EventHandlingError {
    pub fn new(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            message: message.into(),
            aggregate_id: None,
            undeserializable: None,
        }
    }

    pub fn for_aggregate(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn with_undeserializable(mut self, event: UndeserializableEvent) -> Self {
        self.undeserializable = Some(event);
        self
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// Repository::save → Event Store (append) → Event Bus (publish) → Handlers
///                                                              └─ Subscriptions
/// ```
#[async_trait]
pub trait EventBus<M>: Send + Sync
where
    M: Clone + Send + Sync + 'static,
{
    /// Publish a message to all subscriptions, then run every registered handler.
    async fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;

    fn register(&self, handler: Arc<dyn EventHandler<M>>) -> HandlerId;

    /// Remove a handler. Returns `false` when the id was unknown.
    fn unregister(&self, id: HandlerId) -> bool;

    fn publish_error(&self, error: EventHandlingError);

    /// Subscribe to handler failures.
    fn errors(&self) -> Subscription<EventHandlingError>;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Clone + Send + Sync + 'static,
    B: EventBus<M> + ?Sized,
{
    async fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message).await
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }

    fn register(&self, handler: Arc<dyn EventHandler<M>>) -> HandlerId {
        (**self).register(handler)
    }

    fn unregister(&self, id: HandlerId) -> bool {
        (**self).unregister(id)
    }

    fn publish_error(&self, error: EventHandlingError) {
        (**self).publish_error(error)
    }

    fn errors(&self) -> Subscription<EventHandlingError> {
        (**self).errors()
    }
}
