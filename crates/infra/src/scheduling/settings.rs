//! Scheduler settings.

use std::time::Duration;

const PRECONDITION_TIMEOUT_VAR: &str = "CHRONICLE_PRECONDITION_TIMEOUT_SECS";
const POLL_INTERVAL_VAR: &str = "CHRONICLE_POLL_INTERVAL_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// How long a precondition watcher waits for the event it depends on.
    pub precondition_timeout: Duration,
    /// How often the poller looks for due commands.
    pub poll_interval: Duration,
    /// Name used in logs and in errors published on the bus.
    pub scheduler_name: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            precondition_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            scheduler_name: "command-scheduler".to_string(),
        }
    }
}

impl SchedulerSettings {
    /// Defaults, overridden by `CHRONICLE_PRECONDITION_TIMEOUT_SECS` and
    /// `CHRONICLE_POLL_INTERVAL_MS` when set.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            precondition_timeout: env_u64(PRECONDITION_TIMEOUT_VAR)
                .map(Duration::from_secs)
                .unwrap_or(defaults.precondition_timeout),
            poll_interval: env_u64(POLL_INTERVAL_VAR)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            scheduler_name: defaults.scheduler_name,
        }
    }

    pub fn with_precondition_timeout(mut self, timeout: Duration) -> Self {
        self.precondition_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_name = name.into();
        self
    }
}

fn env_u64(var: &str) -> Option<u64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var, value = %raw, "ignoring unparseable setting; using default");
            None
        }
    }
}
