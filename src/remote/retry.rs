//! Retrying remote caller
//!
//! Bounded exponential-backoff wrapper shared by every outbound dependency:
//! the observation provider, the generative-content service, and the image
//! search proxy. Rate limits and timeouts are retryable; anything else fails
//! immediately. After the retry ceiling the caller sees one opaque upstream
//! error; retryable conditions are never surfaced directly.
//!
//! Backoff is pure `base_delay * 2^(attempt-1)` with no jitter, matching the
//! observed upstream behavior.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::types::{Result, RookeryError};

/// Classified outcome of a single remote attempt
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Provider returned an explicit rate-limit response
    #[error("rate limited")]
    RateLimited,

    /// Request timed out
    #[error("timed out")]
    Timeout,

    /// Any other failure; not worth retrying
    #[error("{0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::RateLimited | RemoteError::Timeout)
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Fatal(e.to_string())
        }
    }
}

/// Retry configuration for one capability
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry
    pub base_delay: Duration,
    /// Per-request timeout handed to the HTTP client
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            timeout,
        }
    }

    /// Delay after a failed attempt: `base * 2^(attempt-1)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Run `op` with bounded exponential backoff.
///
/// Retryable failures sleep and try again up to `policy.max_attempts`; fatal
/// failures and an exhausted ceiling both come back as an opaque upstream
/// error. `target` names the dependency for the retry logs.
pub async fn call_with_retry<T, F, Fut>(
    target: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, RemoteError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                if attempt >= policy.max_attempts {
                    return Err(RookeryError::Upstream(format!(
                        "{target} still failing ({e}) after {attempt} attempts"
                    )));
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    target_service = %target,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retryable upstream failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(RemoteError::Fatal(msg)) => {
                return Err(RookeryError::Upstream(format!("{target}: {msg}")));
            }
            // unreachable arm-wise, but keeps the match exhaustive if the
            // retryable set ever changes
            Err(e) => return Err(RookeryError::Upstream(format!("{target}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(100), Duration::from_secs(5))
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let p = policy(5);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retryable_failures() {
        let calls = AtomicU32::new(0);
        let result = call_with_retry("fake", &policy(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 5 {
                    Err(RemoteError::RateLimited)
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_after_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = call_with_retry("fake", &policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::Timeout) }
        })
        .await;

        assert!(matches!(result, Err(RookeryError::Upstream(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_fails_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = call_with_retry("fake", &policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::Fatal("boom".into())) }
        })
        .await;

        assert!(matches!(result, Err(RookeryError::Upstream(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_follow_exponential_schedule() {
        let start = tokio::time::Instant::now();
        let calls = AtomicU32::new(0);
        let _: Result<()> = call_with_retry("fake", &policy(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::RateLimited) }
        })
        .await;

        // 100 + 200 + 400 ms of backoff across 4 attempts
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }
}
