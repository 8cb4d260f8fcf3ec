//! Bounded retry around a unit of work
//!
//! [`RobustExecutor`] runs a work item up to `max_attempts` times, sleeping
//! between attempts according to a [`BackoffPolicy`]. Attempts run one after
//! another on the calling task; there are no speculative parallel attempts.
//! After the last failed attempt the last error is returned unchanged.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classifies errors that may succeed when retried
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Delay between attempts.
///
/// The delay before retry `n` (0-indexed) is `first × factor^n`, clamped to
/// `max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Initial delay before the first retry
    pub first: Duration,
    /// Maximum delay cap
    pub max: Duration,
    /// Multiplicative growth factor
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Retry immediately
    #[must_use]
    pub const fn none() -> Self {
        Self {
            first: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Delay before retry `attempt` (0-indexed)
    #[must_use]
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let clamped_exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped_secs = self.first.as_secs_f64() * self.factor.powi(clamped_exp);

        if !unclamped_secs.is_finite() || unclamped_secs < 0.0 || unclamped_secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped_secs)
        }
    }
}

/// Retry wrapper with a fixed attempt budget
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RobustExecutor {
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl Default for RobustExecutor {
    fn default() -> Self {
        Self::new(3, BackoffPolicy::default())
    }
}

impl RobustExecutor {
    /// `max_attempts` below one is treated as one
    #[must_use]
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Run `work` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent.
    pub async fn execute<T, E, F, Fut>(&self, label: &str, mut work: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 1;
        loop {
            match work().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt >= self.max_attempts || !err.is_retryable() => {
                    warn!(label, attempt, error = %err, "Giving up");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.backoff.next(attempt - 1);
                    debug!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
        };
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(3), Duration::from_millis(800));
        assert_eq!(policy.next(10), Duration::from_secs(1));
        assert_eq!(BackoffPolicy::none().next(5), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let executor = RobustExecutor::new(3, BackoffPolicy::none());

        let result = executor
            .execute("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(StageError::Transient(format!("attempt {n}")))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_surfaces_last_failure() {
        let calls = AtomicU32::new(0);
        let executor = RobustExecutor::new(4, BackoffPolicy::none());

        let result: Result<(), _> = executor
            .execute("broken", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(StageError::Transient(format!("attempt {n}")))
            })
            .await;

        assert_eq!(result, Err(StageError::Transient("attempt 4".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let executor = RobustExecutor::default();

        let result: Result<(), _> = executor
            .execute("fatal", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StageError::Fatal("corrupt model".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_attempts() {
        let executor = RobustExecutor::new(3, BackoffPolicy::default());
        let start = tokio::time::Instant::now();

        let _: Result<(), _> = executor
            .execute("slow", || async { Err(StageError::Transient("busy".into())) })
            .await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RobustExecutor::new(0, BackoffPolicy::none()).max_attempts(), 1);
    }
}
