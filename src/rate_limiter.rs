//! Process-global sliding-window rate limiter over LLM calls.
//!
//! Per the design notes, the rate limiter's lifecycle is bound to the
//! worker process and it is created once at startup, then shared (an
//! `Arc`) across every node invocation that talks to a grading collaborator.
//! It throttles by blocking the caller up to a bounded wait and then
//! failing with a retryable error — the node's own retry wrapper is what
//! turns that into another attempt.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};

/// Sliding-window limiter over calls-per-second to an external grader.
/// `max_wait` bounds how long [`RateLimiter::acquire`] will block before
/// giving up and reporting the call as rate-limited.
pub struct RateLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    max_wait: Duration,
}

#[derive(Debug, thiserror::Error)]
#[error("rate limiter saturated after waiting {waited:?}")]
pub struct RateLimitExceeded {
    pub waited: Duration,
}

impl RateLimiter {
    /// `calls_per_second` bounds the sustained throughput; `burst` is the
    /// number of calls the window allows instantaneously before throttling
    /// kicks in.
    #[must_use]
    pub fn new(calls_per_second: u32, burst: u32, max_wait: Duration) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(calls_per_second.max(1)).unwrap())
            .allow_burst(NonZeroU32::new(burst.max(1)).unwrap());
        Self {
            inner: GovernorLimiter::direct(quota),
            max_wait,
        }
    }

    /// Blocks the caller until a slot frees up, up to `max_wait`. Returns
    /// `Err` when the window stays saturated past the bound — the caller
    /// (a grading node) should classify this as retryable and let its own
    /// backoff loop decide whether to try again.
    pub async fn acquire(&self) -> Result<(), RateLimitExceeded> {
        match tokio::time::timeout(self.max_wait, self.inner.until_ready()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(RateLimitExceeded {
                waited: self.max_wait,
            }),
        }
    }
}

impl Default for RateLimiter {
    /// 5 calls/sec sustained, burst of 10, blocking up to 10s before
    /// failing — generous defaults for an LLM grading collaborator.
    fn default() -> Self {
        Self::new(5, 10, Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_calls_within_quota() {
        let limiter = RateLimiter::new(100, 100, Duration::from_secs(1));
        for _ in 0..10 {
            limiter.acquire().await.expect("within burst");
        }
    }

    #[tokio::test]
    async fn saturates_and_reports_exceeded_within_bounded_wait() {
        let limiter = RateLimiter::new(1, 1, Duration::from_millis(50));
        limiter.acquire().await.expect("first call uses the burst slot");
        let result = limiter.acquire().await;
        assert!(result.is_err());
    }
}
