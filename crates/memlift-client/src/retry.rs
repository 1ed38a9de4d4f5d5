//! Retry with exponential backoff and jitter.
//!
//! Every network call made by the migration engine runs through
//! [`retry_async`] with an explicit [`RetryPolicy`] and a [`Clock`]. The clock
//! is injectable so backoff schedules can be tested without sleeping.
//!
//! Jitter uses `std::time::SystemTime` UNIX nanos as a seed to avoid
//! requiring the `rand` crate as a dependency.

use async_trait::async_trait;
use memlift_types::config::RetryPolicy;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of backoff delays.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that records requested sleeps and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct RecordingClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingClock {
    /// Create a new recording clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// All sleeps requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        /// The successful result.
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// All retries exhausted, or the error was not retryable.
    Exhausted {
        /// The error from the last attempt.
        last_error: E,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Collapse into a plain `Result`.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Success { result, .. } => Ok(result),
            Self::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff computation
// ---------------------------------------------------------------------------

/// Compute the delay for a given attempt (0-indexed).
///
/// Formula: `min(min_delay * 2^attempt, max_delay) * (1 + random * jitter)`
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let base = policy
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(policy.max_delay_ms);

    if policy.jitter <= 0.0 {
        return capped;
    }

    let frac = pseudo_random_fraction();
    let jitter_offset = (capped as f64) * frac * policy.jitter;
    let with_jitter = (capped as f64) + jitter_offset;

    // Never exceed the cap, jitter included.
    (with_jitter as u64).min(policy.max_delay_ms)
}

/// Return a pseudo-random fraction in `[0, 1)` using the current system time
/// nanos. This is NOT cryptographically secure, but good enough for jitter.
fn pseudo_random_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let mixed = nanos.wrapping_mul(2654435761); // Knuth multiplicative hash
    (mixed as f64) / (u32::MAX as f64 + 1.0)
}

// ---------------------------------------------------------------------------
// Core retry function
// ---------------------------------------------------------------------------

/// Execute an async operation with retry.
///
/// - `policy`: attempts, delays, jitter.
/// - `clock`: where backoff delays are spent.
/// - `operation`: called once per attempt.
/// - `should_retry`: returns `true` if the error is worth another attempt.
pub async fn retry_async<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        attempt = attempt + 1,
                        "retry succeeded after {} previous failures", attempt
                    );
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => {
                let retryable = should_retry(&err);
                if !retryable {
                    debug!(
                        attempt = attempt + 1,
                        error = %err,
                        "error is not retryable, giving up"
                    );
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt + 1,
                    };
                }
                if attempt + 1 >= max {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = max,
                        error = %err,
                        "all retry attempts exhausted"
                    );
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt + 1,
                    };
                }

                let delay_ms = compute_backoff(policy, attempt);
                debug!(attempt = attempt + 1, delay_ms, error = %err, "retrying after error");
                clock.sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use memlift_types::error::MemliftError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, min_delay_ms: u64, max_delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            min_delay_ms,
            max_delay_ms,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_compute_backoff_exponential() {
        let p = policy(5, 100, 100_000);
        assert_eq!(compute_backoff(&p, 0), 100);
        assert_eq!(compute_backoff(&p, 1), 200);
        assert_eq!(compute_backoff(&p, 2), 400);
        assert_eq!(compute_backoff(&p, 3), 800);
    }

    #[test]
    fn test_compute_backoff_capped() {
        let p = policy(10, 1_000, 5_000);
        assert_eq!(compute_backoff(&p, 2), 4_000);
        assert_eq!(compute_backoff(&p, 3), 5_000);
        assert_eq!(compute_backoff(&p, 64), 5_000);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = RetryPolicy {
            max_attempts: 3,
            min_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter: 0.5,
        };
        for _ in 0..50 {
            let d = compute_backoff(&p, 1);
            assert!((2_000..=3_000).contains(&d), "delay {d} out of range");
        }
    }

    #[tokio::test]
    async fn test_retry_success_first_try() {
        let clock = RecordingClock::new();
        let outcome = retry_async(
            &policy(3, 10, 100),
            &clock,
            || async { Ok::<&str, MemliftError>("hello") },
            MemliftError::is_retryable,
        )
        .await;

        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.into_result().unwrap(), "hello");
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_retry_follows_backoff_schedule() {
        let clock = RecordingClock::new();
        let counter = AtomicU32::new(0);

        let outcome = retry_async(
            &policy(5, 100, 10_000),
            &clock,
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(MemliftError::TransientFetch("503".into()))
                    } else {
                        Ok("finally")
                    }
                }
            },
            MemliftError::is_retryable,
        )
        .await;

        assert_eq!(outcome.attempts(), 4);
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let clock = RecordingClock::new();
        let outcome = retry_async(
            &policy(3, 1, 10),
            &clock,
            || async { Err::<(), _>(MemliftError::TransientWrite("always fails".into())) },
            MemliftError::is_retryable,
        )
        .await;

        match outcome {
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                assert!(matches!(last_error, MemliftError::TransientWrite(_)));
                assert_eq!(attempts, 3);
            }
            _ => panic!("expected exhausted"),
        }
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let clock = RecordingClock::new();
        let counter = AtomicU32::new(0);

        let outcome = retry_async(
            &policy(5, 1, 10),
            &clock,
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(MemliftError::NotFound("agent-x".into())) }
            },
            MemliftError::is_retryable,
        )
        .await;

        assert_eq!(outcome.attempts(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let clock = RecordingClock::new();
        let outcome = retry_async(
            &policy(0, 1, 10),
            &clock,
            || async { Err::<(), _>(MemliftError::TransientFetch("x".into())) },
            MemliftError::is_retryable,
        )
        .await;
        assert_eq!(outcome.attempts(), 1);
    }

    #[tokio::test]
    async fn test_tokio_clock_sleeps() {
        let start = std::time::Instant::now();
        TokioClock.sleep(Duration::from_millis(5)).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
