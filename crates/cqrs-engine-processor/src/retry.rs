//! Backoff policies for event-handler retries and stream restarts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff applied between retries of a failed event handler and between
/// restarts of a terminated observe stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryPolicy {
    /// Retry immediately.
    None,
    /// A constant delay between attempts.
    #[serde(rename_all = "kebab-case")]
    Fixed { interval_seconds: u64 },
    /// Delay grows by `multiplier` per attempt, capped at
    /// `max_interval_seconds`.
    #[serde(rename_all = "kebab-case")]
    Exponential {
        initial_interval_seconds: u64,
        multiplier: f64,
        max_interval_seconds: u64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::None
    }
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        RetryPolicy::Fixed {
            interval_seconds: interval.as_secs(),
        }
    }

    /// The delay before the given attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Fixed { interval_seconds } => Duration::from_secs(*interval_seconds),
            RetryPolicy::Exponential {
                initial_interval_seconds,
                multiplier,
                max_interval_seconds,
            } => {
                let factor = multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
                let seconds = (*initial_interval_seconds as f64 * factor)
                    .min(*max_interval_seconds as f64);
                Duration::from_secs_f64(seconds)
            }
        }
    }
}
