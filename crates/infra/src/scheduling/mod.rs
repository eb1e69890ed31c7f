//! Command scheduling and delivery.
//!
//! ## Components
//!
//! - `CommandScheduler`: schedule/deliver API
//! - `CommandSchedulerPipeline`: interceptors around schedule and deliver
//! - `DeliveryExecutor`: applies a command, records success or failure
//! - `RetryPolicy`: quadratic backoff for failed deliveries
//! - `ScheduledCommandStore`: every scheduled command and its latest state
//! - precondition watcher: delivers once a depended-on event is published
//! - `DueCommandPoller`: delivers commands as they come due
//! - `SchedulingConfiguration`: per-aggregate composition root

pub mod configuration;
pub mod delivery;
pub mod pipeline;
pub mod poller;
pub mod precondition;
pub mod retry;
pub mod scheduler;
pub mod settings;
pub mod store;

pub use configuration::{SchedulerResolver, SchedulingConfiguration};
pub use delivery::{AuthorizationPolicy, DeliveryExecutor, FailureHandlers};
pub use pipeline::{
    BoxFuture, CommandSchedulerPipeline, ComposedChain, Interceptor, Next, SchedulingResult, Terminal,
    interceptor,
};
pub use poller::{DueCommandPoller, DueCommandPollerHandle, PollerStats};
pub use precondition::{
    EventStorePreconditionVerifier, PreconditionVerifier, deliver_if_precondition_is_satisfied_within,
};
pub use retry::RetryPolicy;
pub use scheduler::{CommandScheduler, DeliveryReport, SchedulingError};
pub use settings::SchedulerSettings;
pub use store::{InMemoryScheduledCommandStore, ScheduledCommandStore, ScheduledCommandStoreError};
