//! Clock abstraction for due-time evaluation.
//!
//! Scheduling code never reads the system time directly; it asks a `Clock`.
//! Production wiring uses `SystemClock`, tests use `VirtualClock` and move time
//! forward explicitly.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<C> Clock for Arc<C>
where
    C: Clock + ?Sized,
{
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall-clock time.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same underlying time, so a clock handed to a scheduler can
/// be advanced from the test body.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    started_at: DateTime<Utc>,
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl VirtualClock {
    /// Start a virtual clock at the current wall-clock time.
    pub fn start() -> Self {
        Self::start_at(Utc::now())
    }

    pub fn start_at(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            now: Arc::new(RwLock::new(at)),
        }
    }

    /// Move time forward and return the new "now".
    pub fn advance_by(&self, by: Duration) -> DateTime<Utc> {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
        *now
    }

    /// Jump to an absolute time (may move backwards).
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = at;
    }

    /// Return to the time the clock was started at.
    pub fn reset(&self) {
        self.set(self.started_at);
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}
