//! Bounded retry with exponential backoff and per-call timeouts.
//!
//! Every call to the finance provider, the messaging channel and the
//! categorizer goes through [`with_timeout`]; provider fetches and channel
//! send/edit additionally go through [`with_retry`]. A timeout is always
//! reported as a transient error of the collaborator's own error type.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    /// No sleeping between attempts; used by tests and one-shot tools.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(5),
        }
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.min(10);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(20),
        }
    }
}

/// Errors that distinguish retryable from permanent failures.
pub trait Transient {
    fn is_transient(&self) -> bool;
    /// The error reported when a call exceeds its timeout.
    fn timed_out(after: Duration) -> Self;
}

pub async fn with_timeout<T, E, Fut>(limit: Duration, fut: Fut) -> Result<T, E>
where
    E: Transient,
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(E::timed_out(limit)),
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts are exhausted.
/// The last error is returned on exhaustion.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match with_timeout(policy.call_timeout, op()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = policy.backoff(attempt);
                warn!(%err, what, attempt, ?delay, "transient failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("fatal")]
        Fatal,
        #[error("timeout")]
        Timeout,
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Flaky | TestError::Timeout)
        }
        fn timed_out(_after: Duration) -> Self {
            TestError::Timeout
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(5));
        assert_eq!(policy.backoff(40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<u32, TestError> = with_retry(&RetryPolicy::default(), "op", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(TestError::Flaky)
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(res, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<(), TestError> = with_retry(&RetryPolicy::default(), "op", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Fatal)
        })
        .await;
        assert_eq!(res, Err(TestError::Fatal));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<(), TestError> = with_retry(&RetryPolicy::immediate(2), "op", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Flaky)
        })
        .await;
        assert_eq!(res, Err(TestError::Flaky));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_transient() {
        let res: Result<(), TestError> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(res, Err(TestError::Timeout));
    }
}
