//! `chronicle-core`: identifiers, errors, the aggregate contract and clocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, aggregate traits and the clock
//! abstraction used for due-time evaluation.

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, ETag};
