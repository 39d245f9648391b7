//! Bounded retry with a fixed delay between attempts.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// How many times to try and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Clamped to at least one.
    pub attempts: u32,
    /// Pause between consecutive attempts. The first attempt runs immediately.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Outcome of a single failed attempt.
pub enum RetryError<E> {
    /// Consume an attempt and try again after the delay.
    Transient(E),
    /// Stop immediately and surface the error.
    Fatal(E),
}

/// Run `op` until it succeeds, fails fatally, or the policy is exhausted.
/// The attempt index (zero-based) is passed to each invocation.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(RetryError::Fatal(e)) => return Err(e),
            Err(RetryError::Transient(e)) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(e);
                }
                sleep(policy.delay).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_a_later_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let result: Result<u32, &str> = retry(policy, |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(RetryError::Transient("not yet"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result: Result<(), u32> = retry(policy, |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(RetryError::Transient(attempt)) }
        })
        .await;

        assert_eq!(result.unwrap_err(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::new(4, Duration::from_millis(1));

        let result: Result<(), &str> = retry(policy, |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(RetryError::Fatal("gone")) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "gone");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        let result: Result<&str, &str> = retry(policy, |_| async move { Ok("ran") }).await;
        assert_eq!(result.unwrap(), "ran");
    }
}
