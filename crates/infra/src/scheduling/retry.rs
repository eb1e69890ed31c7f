//! Retry policy for failed deliveries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempts after which a failed delivery is no longer retried.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Quadratic backoff: the n-th attempt is retried after `base_delay * n²`.
///
/// With the defaults a command is retried after 1, 4, 9, 16 and 25 minutes,
/// then left failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = no retries)
    pub max_attempts: u32,
    /// Delay unit
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn quadratic(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before retrying after `attempt` attempts (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_mul(attempt))
    }

    /// Whether a command that had already been attempted `previous_attempts`
    /// times before the failing attempt may be retried.
    pub fn should_retry(&self, previous_attempts: u32) -> bool {
        previous_attempts < self.max_attempts
    }
}
