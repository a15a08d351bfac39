//! Randomized exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;

use proto::Retryable;
use rand::Rng;
use tracing::{debug, warn};

/// Backoff schedule.
///
/// Attempt `n` (1-based) that fails with a retryable error is followed by a
/// uniformly random pause in `[initial_delay, min(max_delay, initial_delay *
/// 2^(n-1))]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Policy with millisecond delays and the default attempt count.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Self::default()
        }
    }

    /// Upper bound of the pause after the given 1-based attempt.
    #[must_use]
    pub fn max_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Random pause after the given 1-based attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let upper = self.max_delay_for_attempt(attempt);
        let lower = self.initial_delay.min(upper);
        if lower == upper {
            return upper;
        }
        rand::thread_rng().gen_range(lower..=upper)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts are exhausted. The last error is returned unchanged.
    pub async fn run<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !error.is_retryable() || attempt >= self.max_attempts {
                        return Err(error);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying LLM call after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
