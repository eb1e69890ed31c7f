//! Infrastructure layer: event store, repositories, migration and the command
//! scheduler.

pub mod event_store;
pub mod migration;
pub mod repository;
pub mod scheduling;

pub use migration::{EventMigrator, MigrationError, Rename};
pub use repository::{
    EventSourcedRepository, EventStoreRepository, MigratableRepository, RepositoryError, SharedEventBus,
};

#[cfg(test)]
mod integration_tests;
