//! Bounded retry policy
//!
//! Every place that retries (signaling fallback method names, rejoin after a
//! signaling reconnect) goes through [`RetryPolicy`] so attempt limits and
//! delays live in configuration instead of loops.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Attempt limit plus delay schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "crate::types::duration_ms")]
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_factor: u32,
    /// Upper bound on a single delay
    #[serde(with = "crate::types::duration_ms")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Try once, never wait
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_factor: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// Policy for re-registering membership after a signaling reconnect
    pub fn rejoin() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 2,
            max_delay: Duration::from_secs(4),
        }
    }

    /// Policy for walking through fallback method names
    pub fn fallback_names() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            backoff_factor: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// Effective attempt count
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.backoff_factor.max(1).saturating_pow(exponent);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay.max(self.initial_delay))
    }

    /// Run `op` until it succeeds or attempts are exhausted
    ///
    /// `op` receives the 1-based attempt number. On exhaustion the error of
    /// the last attempt is returned together with the number of attempts made.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] carrying the last failure.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    return Err(RetryError {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fallback_names()
    }
}

/// Retry exhaustion
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {last}")]
pub struct RetryError<E> {
    /// Attempts made
    pub attempts: u32,
    /// Error of the final attempt
    pub last: E,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_schedule_is_capped() {
        let policy = RetryPolicy::rejoin();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_secs(1));
        assert_eq!(policy.delay_after(3), Duration::from_secs(2));
        assert_eq!(policy.delay_after(4), Duration::from_secs(4));
        assert_eq!(policy.delay_after(10), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::rejoin()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("down") }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, "down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_passes_attempt_number_and_returns_first_success() {
        let seen = parking_lot::Mutex::new(Vec::new());
        let value = RetryPolicy::fallback_names()
            .run(|attempt| {
                seen.lock().push(attempt);
                async move {
                    if attempt < 2 {
                        Err("unsupported")
                    } else {
                        Ok(attempt * 10)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 20);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::once()
        };
        assert_eq!(policy.attempts(), 1);
    }
}
