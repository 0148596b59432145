//! Bounded exponential-backoff retry, generic over any fallible async
//! operation whose error can say whether trying again is worth it.
//!
//! This is a combinator, not something wired only into grading nodes: the
//! same [`retry`] function underlies `segment`'s retry policy, `grade_question`'s,
//! and any future node type, parameterized by a [`RetryPolicy`] value.

use std::future::Future;
use std::time::Duration;

/// Attempts, initial delay, multiplier, and cap for exponential backoff.
///
/// Delays are monotonically non-decreasing across attempts: `initial_delay`,
/// `initial_delay * multiplier`, `initial_delay * multiplier^2`, ..., each
/// capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs_f64(1.0),
            multiplier: 2.0,
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// The delay before attempt `attempt_index` (0-based: the delay before
    /// the *second* attempt is `delay_for(0)`).
    #[must_use]
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = self.multiplier.powi(attempt_index as i32);
        let scaled = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }
}

/// Outcome of a retried operation once attempts are exhausted.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation eventually succeeded, on attempt number `attempts`
    /// (1-based).
    Succeeded { value: T, attempts: u32 },
    /// Attempts ran out, or the error on some attempt was classified
    /// non-retryable. `last_error` is what should be recorded against the
    /// `errors` channel; the caller (typically a node body) is responsible
    /// for turning this into the degraded-result contract of §4.2.
    Exhausted { last_error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } => *attempts,
            RetryOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }

    #[must_use]
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Runs `operation` up to `policy.max_attempts` times, sleeping between
/// attempts per [`RetryPolicy::delay_for`]. `is_retryable` classifies each
/// error; a non-retryable error short-circuits immediately without
/// spending the remaining attempt budget or sleeping.
pub async fn retry<T, E, Fut, Op, Classify>(
    policy: RetryPolicy,
    is_retryable: Classify,
    mut operation: Op,
) -> RetryOutcome<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Classify: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return RetryOutcome::Succeeded { value, attempts: attempt },
            Err(error) => {
                let retryable = is_retryable(&error);
                if !retryable || attempt >= policy.max_attempts {
                    return RetryOutcome::Exhausted {
                        last_error: error,
                        attempts: attempt,
                    };
                }
                tokio::time::sleep(policy.delay_for(attempt - 1)).await;
            }
        }
    }
}
