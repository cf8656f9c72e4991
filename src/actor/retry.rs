//! Backoff policies for supervised workers that reconnect after errors.

use std::time::Duration;

/// How long a worker waits before its next attempt.
///
/// `Fixed` keeps the same delay forever. `Exponential` doubles the delay after
/// every consecutive failure, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed {
        delay: Duration,
    },
    Exponential {
        initial_delay: Duration,
        max_delay: Duration,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(crate::constants::WATCH_RETRY_DELAY_SECS))
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::Exponential {
            initial_delay,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based count of consecutive failures).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
            } => {
                let shift = attempt.saturating_sub(1).min(16);
                initial_delay
                    .saturating_mul(1u32 << shift)
                    .min(*max_delay)
            }
        }
    }
}
