//! In-memory event bus for tests/dev.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::bus::{BusError, EventBus, EventHandler, EventHandlingError, HandlerId, Subscription};

const DEFAULT_CAPACITY: usize = 1024;

/// In-memory pub/sub bus.
///
/// - Best-effort fan-out to subscriptions (tokio broadcast channel)
/// - Registered handlers are awaited in registration order on every publish
/// - At-least-once acceptable (subscribers must be idempotent)
pub struct InMemoryEventBus<M> {
    messages: broadcast::Sender<M>,
    errors: broadcast::Sender<EventHandlingError>,
    handlers: Mutex<Vec<(HandlerId, Arc<dyn EventHandler<M>>)>>,
    next_handler_id: AtomicU64,
}

impl<M: Clone> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Messages buffered per subscription before a slow subscriber starts lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (messages, _) = broadcast::channel(capacity);
        let (errors, _) = broadcast::channel(capacity);
        Self {
            messages,
            errors,
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl<M: Clone> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> core::fmt::Debug for InMemoryEventBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &self.messages.receiver_count())
            .field("error_subscribers", &self.errors.receiver_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn publish(&self, message: M) -> Result<(), BusError> {
        // No receivers is not an error.
        let _ = self.messages.send(message.clone());

        // Snapshot so no lock is held across an await.
        let handlers: Vec<_> = {
            let handlers = self.handlers.lock().map_err(|_| BusError::Poisoned)?;
            handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };

        for handler in handlers {
            if let Err(error) = handler.handle(&message).await {
                tracing::warn!(handler = handler.name(), error = %error, "event handler failed");
                self.publish_error(error);
            }
        }

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        Subscription::new(self.messages.subscribe())
    }

    fn register(&self, handler: Arc<dyn EventHandler<M>>) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        // A poisoned registry still accepts handlers.
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.push((id, handler));
        id
    }

    fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    fn publish_error(&self, error: EventHandlingError) {
        let _ = self.errors.send(error);
    }

    fn errors(&self) -> Subscription<EventHandlingError> {
        Subscription::new(self.errors.subscribe())
    }
}
