//! Domain events, commands and the scheduled-command entity.
//!
//! Everything in this crate is storage- and transport-agnostic. Infrastructure
//! (event store, repository, scheduler) lives in `chronicle-infra`.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod scheduled;
pub mod sourced;

pub use bus::{
    BusError, EventBus, EventHandler, EventHandlingError, HandlerId, Subscription, UndeserializableEvent,
};
pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::{Event, EventSchema};
pub use handler::execute;
pub use in_memory_bus::InMemoryEventBus;
pub use scheduled::{
    CommandBody, CommandFailed, CommandResult, CommandSucceeded, DeliveryError,
    DeliveryPrecondition, DependencyEvent, ScheduledCommand, ScheduledCommandFailureHandler,
};
pub use sourced::{AnonymousEvent, EventSourced, HistoricalEvent, PendingEvent, RecordedEvent, Sourced};
