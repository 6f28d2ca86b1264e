//! crates/storybook_core/src/retry.rs
//!
//! A bounded retry policy with a terminal fallback value, for stages whose output
//! can be malformed but whose failure should degrade rather than abort.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tracing::warn;

/// How often and how patiently an attempt is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no waiting between attempts.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delays before the 2nd, 3rd, ... attempt: base, 2*base, 4*base, capped.
    fn delays(&self) -> impl Iterator<Item = Duration> {
        let half_base_ms = (self.base_delay.as_millis() / 2) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(half_base_ms)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// The result of a single failed attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// The output was unusable; try again while the budget lasts.
    Retry(String),
    /// Stop immediately and surface the error.
    Abort(E),
}

/// Runs `attempt` under `policy`.
///
/// Returns the first successful value, the `fallback` value once every attempt asked
/// for a retry, or the error of the first attempt that aborted.
pub async fn retry_or_fallback<T, E, F, Fut, D>(
    policy: &RetryPolicy,
    label: &str,
    mut attempt: F,
    fallback: D,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
    D: FnOnce() -> T,
    E: Display,
{
    if policy.max_attempts == 0 {
        return Ok(fallback());
    }

    let mut attempts = 0usize;
    let outcome = Retry::spawn(policy.delays(), || {
        attempts += 1;
        let number = attempts;
        let fut = attempt();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(Attempt::Retry(reason)) => {
                    warn!(label, attempt = number, %reason, "Attempt produced unusable output");
                    Err(RetryError::Transient {
                        err: Attempt::Retry(reason),
                        retry_after: None,
                    })
                }
                Err(Attempt::Abort(e)) => Err(RetryError::Permanent(Attempt::Abort(e))),
            }
        }
    })
    .await;

    match outcome {
        Ok(value) => Ok(value),
        Err(Attempt::Retry(reason)) => {
            warn!(label, %reason, "Retry budget exhausted; using fallback");
            Ok(fallback())
        }
        Err(Attempt::Abort(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, String> = retry_or_fallback(
            &RetryPolicy::immediate(3),
            "test",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Attempt::Retry("bad".to_string()))
                    } else {
                        Ok(7)
                    }
                }
            },
            || 0,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn falls_back_after_exactly_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, String> = retry_or_fallback(
            &RetryPolicy::immediate(3),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Attempt::Retry("still bad".to_string())) }
            },
            || 42,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn abort_stops_without_fallback() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, String> = retry_or_fallback(
            &RetryPolicy::immediate(3),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Attempt::Abort("backend down".to_string())) }
            },
            || 42,
        )
        .await;
        assert_eq!(result.unwrap_err(), "backend down");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
