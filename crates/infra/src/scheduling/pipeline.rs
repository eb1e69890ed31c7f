//! Interceptor pipelines around scheduling and delivery.
//!
//! Interceptors are registered in order on a `CommandSchedulerPipeline`. When
//! a scheduler is resolved the registrations are composed into immutable
//! chains; the most recently registered interceptor is the outermost layer:
//!
//! ```text
//! register X, then Y
//!
//! Y-pre → X-pre → handler → X-post → Y-post
//! ```
//!
//! Interceptors registered after a chain was composed do not affect it; they
//! take effect the next time a scheduler is resolved.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use chronicle_events::ScheduledCommand;

use super::scheduler::SchedulingError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type SchedulingResult<C> = Result<ScheduledCommand<C>, SchedulingError>;

/// The innermost step of a chain.
pub type Terminal<C> = Arc<dyn Fn(ScheduledCommand<C>) -> BoxFuture<'static, SchedulingResult<C>> + Send + Sync>;

/// Wraps scheduling or delivery of a command.
///
/// An interceptor may inspect or replace the command, call `next.run(...)`
/// zero or one times, and inspect or replace the result.
#[async_trait]
pub trait Interceptor<C>: Send + Sync {
    async fn intercept(&self, command: ScheduledCommand<C>, next: Next<C>) -> SchedulingResult<C>;
}

#[async_trait]
impl<C, F> Interceptor<C> for F
where
    C: Send + 'static,
    F: Fn(ScheduledCommand<C>, Next<C>) -> BoxFuture<'static, SchedulingResult<C>> + Send + Sync,
{
    async fn intercept(&self, command: ScheduledCommand<C>, next: Next<C>) -> SchedulingResult<C> {
        self(command, next).await
    }
}

/// The rest of the chain, from an interceptor's point of view.
pub struct Next<C> {
    chain: Arc<[Arc<dyn Interceptor<C>>]>,
    index: usize,
    terminal: Terminal<C>,
}

impl<C: Send + 'static> Next<C> {
    pub fn run(self, command: ScheduledCommand<C>) -> BoxFuture<'static, SchedulingResult<C>> {
        match self.chain.get(self.index).cloned() {
            Some(interceptor) => {
                let next = Next {
                    chain: self.chain,
                    index: self.index + 1,
                    terminal: self.terminal,
                };
                Box::pin(async move { interceptor.intercept(command, next).await })
            }
            None => (self.terminal)(command),
        }
    }
}

impl<C> core::fmt::Debug for Next<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &(self.chain.len().saturating_sub(self.index)))
            .finish_non_exhaustive()
    }
}

/// A composed, immutable interceptor chain, outermost first.
pub struct ComposedChain<C> {
    interceptors: Arc<[Arc<dyn Interceptor<C>>]>,
}

impl<C> Clone for ComposedChain<C> {
    fn clone(&self) -> Self {
        Self {
            interceptors: Arc::clone(&self.interceptors),
        }
    }
}

impl<C> core::fmt::Debug for ComposedChain<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ComposedChain")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl<C: Send + 'static> ComposedChain<C> {
    pub fn empty() -> Self {
        Self {
            interceptors: Arc::from(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run `command` through every interceptor and then `terminal`.
    pub fn run(&self, command: ScheduledCommand<C>, terminal: Terminal<C>) -> BoxFuture<'static, SchedulingResult<C>> {
        Next {
            chain: Arc::clone(&self.interceptors),
            index: 0,
            terminal,
        }
        .run(command)
    }
}

/// Ordered interceptor registrations for one aggregate's scheduler.
pub struct CommandSchedulerPipeline<C> {
    schedule: Vec<Arc<dyn Interceptor<C>>>,
    deliver: Vec<Arc<dyn Interceptor<C>>>,
}

impl<C> Default for CommandSchedulerPipeline<C> {
    fn default() -> Self {
        Self {
            schedule: Vec::new(),
            deliver: Vec::new(),
        }
    }
}

impl<C> core::fmt::Debug for CommandSchedulerPipeline<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandSchedulerPipeline")
            .field("schedule", &self.schedule.len())
            .field("deliver", &self.deliver.len())
            .finish()
    }
}

impl<C: Send + 'static> CommandSchedulerPipeline<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_schedule(&mut self, interceptor: impl Interceptor<C> + 'static) -> &mut Self {
        self.schedule.push(Arc::new(interceptor));
        self
    }

    pub fn on_deliver(&mut self, interceptor: impl Interceptor<C> + 'static) -> &mut Self {
        self.deliver.push(Arc::new(interceptor));
        self
    }

    /// Compose `(schedule, deliver)` chains from the current registrations.
    pub fn compose(&self) -> (ComposedChain<C>, ComposedChain<C>) {
        (outermost_last(&self.schedule), outermost_last(&self.deliver))
    }
}

fn outermost_last<C>(registered: &[Arc<dyn Interceptor<C>>]) -> ComposedChain<C> {
    let chain: Vec<_> = registered.iter().rev().cloned().collect();
    ComposedChain {
        interceptors: Arc::from(chain),
    }
}

/// Box an async closure into an interceptor.
///
/// ```ignore
/// pipeline.on_deliver(interceptor(|cmd, next| async move {
///     tracing::info!(etag = %cmd.etag(), "delivering");
///     next.run(cmd).await
/// }));
/// ```
pub fn interceptor<C, F, Fut>(f: F) -> impl Interceptor<C>
where
    C: Send + 'static,
    F: Fn(ScheduledCommand<C>, Next<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SchedulingResult<C>> + Send + 'static,
{
    move |command: ScheduledCommand<C>, next: Next<C>| -> BoxFuture<'static, SchedulingResult<C>> {
        Box::pin(f(command, next))
    }
}
