//! Bounded Retry
//!
//! Guards backend connection and object lookup against the intermittent
//! failures the Windows management stack produces while drivers start or
//! restart. The loop is iterative with an explicit attempt counter; the
//! delay comes from a [`Backoff`] strategy and the wait itself goes through
//! a [`Pause`] so the ceiling and total delay can be verified without
//! sleeping.

use std::fmt;
use std::time::Duration;

use super::traits::Transient;

/// Delay strategy between attempts
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(Duration),
    /// `initial * multiplier^n`, capped at `max`
    Exponential {
        /// Delay before the first retry
        initial: Duration,
        /// Growth factor per retry
        multiplier: f64,
        /// Upper bound
        max: Duration,
    },
}

impl Backoff {
    /// Delay before retry `n` (0-indexed)
    #[must_use]
    pub fn delay_for_retry(&self, n: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = i32::try_from(n).unwrap_or(i32::MAX);
                let base = initial.as_millis() as f64 * multiplier.powi(exponent);
                let capped = base.min(max.as_millis() as f64).max(0.0);
                Duration::from_millis(capped as u64)
            }
        }
    }
}

/// Something that can wait between attempts
pub trait Pause {
    /// Block for `delay`
    fn pause(&self, delay: Duration);
}

/// Real wall-clock pause
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Outcome of a guarded operation that did not succeed
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Failure from the final attempt
        last: E,
    },
    /// A non-transient failure stopped the loop
    Fatal(E),
}

impl<E> RetryError<E> {
    /// The underlying failure
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Fatal(e) => e,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            Self::Fatal(e) => write!(f, "{e}"),
        }
    }
}

/// Bounded-retry executor
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Policy with a fixed delay; `max_attempts` counts the first try
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed(delay))
    }

    /// Policy with an arbitrary backoff strategy
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Management-interface connection: 20 retries after the first try, 2 s apart
    #[must_use]
    pub fn backend_connect() -> Self {
        Self::fixed(21, Duration::from_secs(2))
    }

    /// Session object lookup: one retry after 500 ms
    #[must_use]
    pub fn object_lookup() -> Self {
        Self::fixed(2, Duration::from_millis(500))
    }

    /// Total attempts including the first
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay strategy
    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out
    ///
    /// `operation` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// `RetryError::Fatal` for a non-transient failure (no pause taken),
    /// `RetryError::Exhausted` once `max_attempts` transient failures occur.
    pub fn run<T, E, F>(&self, label: &str, pause: &dyn Pause, mut operation: F) -> Result<T, RetryError<E>>
    where
        E: Transient + fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(RetryError::Fatal(e)),
                Err(e) if attempt >= self.max_attempts => {
                    tracing::error!(
                        operation = label,
                        attempts = attempt,
                        error = %e,
                        "Retries exhausted"
                    );
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    let delay = self.backoff.delay_for_retry(attempt - 1);
                    tracing::warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient failure (will retry)"
                    );
                    pause.pause(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::RecordingPause;
    use crate::transport::traits::{BackendError, BackendErrorKind};

    fn transient() -> BackendError {
        BackendError::new(BackendErrorKind::Unreachable, "RPC server unavailable")
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let pause = RecordingPause::new();
        let policy = RetryPolicy::fixed(5, Duration::from_secs(2));

        let mut calls = 0;
        let result = policy.run("connect", &pause, |_| {
            calls += 1;
            if calls < 4 {
                Err(transient())
            } else {
                Ok(calls)
            }
        });

        assert_eq!(result.unwrap(), 4);
        assert_eq!(pause.count(), 3);
        assert_eq!(pause.total(), Duration::from_secs(6));
    }

    #[test]
    fn test_exhaustion_after_exact_attempts() {
        let pause = RecordingPause::new();
        let policy = RetryPolicy::fixed(5, Duration::from_secs(2));

        let mut calls = 0;
        let result: Result<(), _> = policy.run("connect", &pause, |_| {
            calls += 1;
            Err(transient())
        });

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("Expected exhaustion, got: {other:?}"),
        }
        assert_eq!(calls, 5);
        // No pause after the final attempt
        assert_eq!(pause.total(), Duration::from_secs(8));
    }

    #[test]
    fn test_fatal_failure_is_not_retried() {
        let pause = RecordingPause::new();
        let policy = RetryPolicy::fixed(5, Duration::from_secs(2));

        let mut calls = 0;
        let result: Result<(), _> = policy.run("call", &pause, |_| {
            calls += 1;
            Err(BackendError::new(BackendErrorKind::CallFailed, "GetValue"))
        });

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls, 1);
        assert_eq!(pause.count(), 0);
    }

    #[test]
    fn test_attempt_numbers_are_one_based() {
        let pause = RecordingPause::new();
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        let mut seen = Vec::new();
        let _: Result<(), _> = policy.run("lookup", &pause, |attempt| {
            seen.push(attempt);
            Err(transient())
        });

        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_default_policies() {
        assert_eq!(RetryPolicy::backend_connect().max_attempts(), 21);
        assert_eq!(
            RetryPolicy::backend_connect().backoff(),
            &Backoff::Fixed(Duration::from_secs(2))
        );
        assert_eq!(RetryPolicy::object_lookup().max_attempts(), 2);
        assert_eq!(
            RetryPolicy::object_lookup().backoff(),
            &Backoff::Fixed(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(1000),
        };

        assert_eq!(backoff.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_retry(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_retry(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_retry(4), Duration::from_millis(1000)); // Capped
    }
}
