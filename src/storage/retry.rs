//! Exponential backoff with jitter for calls that cross the process
//! boundary.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::errors::CoreError;

/// Retry schedule: exponential growth from `base` capped at `cap`, with
/// multiplicative jitter, for at most `max_attempts` total attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fractional jitter; 0.2 means each delay is scaled by a uniform
    /// factor in [0.8, 1.2].
    pub jitter: f64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Storage engine schedule: 100 ms base, 5 s cap, ±20 %, 5 attempts.
    pub fn storage() -> Self {
        RetryPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            jitter: 0.2,
            max_attempts: 5,
        }
    }

    /// External AI service schedule: 1 s base, 3 attempts.
    pub fn external_ai() -> Self {
        RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: 3,
        }
    }

    /// Delay before the given retry. `attempt` is 1-based: the delay after
    /// the first failed attempt is `delay(1)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.cap);
        if self.jitter <= 0.0 {
            return exp;
        }
        let factor: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64((exp.as_secs_f64() * factor).max(0.0))
    }

    /// Runs `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is exhausted. `retryable` classifies errors; the last
    /// error is returned unchanged so the kind survives exhaustion.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: &str,
        retryable: P,
        mut op: F,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && retryable(&err) => {
                    let delay = self.delay(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if attempt > 1 {
                        tracing::warn!(
                            operation,
                            attempts = attempt,
                            error = %err,
                            "retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::storage()
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        // Far past the cap.
        assert_eq!(policy.delay(10), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::storage();
        for _ in 0..50 {
            let d = policy.delay(2).as_secs_f64();
            assert!((0.16..=0.24).contains(&d), "delay {d} outside ±20% band");
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            jitter: 0.0,
            max_attempts: 5,
        };
        let calls = AtomicU32::new(0);
        let result = policy
            .run("test_op", CoreError::is_retryable, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoreError::storage("engine hiccup", true))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let policy = RetryPolicy::storage();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("test_op", CoreError::is_retryable, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::validation("bad input"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(1),
            jitter: 0.0,
            max_attempts: 3,
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("test_op", CoreError::is_retryable, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::storage("still down", true))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            result.unwrap_err(),
            CoreError::ExternalStorage { .. }
        ));
    }
}
