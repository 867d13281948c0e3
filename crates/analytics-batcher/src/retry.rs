// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded retry with doubling backoff.
//!
//! The wait before attempt `n` (n >= 2) is `start * 2^(n-2)`. The last wait is
//! truncated so the cumulative wait never exceeds `expiry`, and no further
//! attempt is made once the budget is used up.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub attempts: u32,
    /// Wait before the second attempt.
    pub start: Duration,
    /// Upper bound on the total time spent waiting between attempts.
    pub expiry: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            start: Duration::from_millis(100),
            expiry: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(attempts: u32, start: Duration, expiry: Duration) -> Self {
        Self {
            attempts,
            start,
            expiry,
        }
    }

    /// Waits before each retry, in order. At most `attempts - 1` entries.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut spent = Duration::ZERO;
        let mut next = self.start;

        for _ in 1..self.attempts.max(1) {
            let remaining = self.expiry.saturating_sub(spent);
            if remaining.is_zero() {
                break;
            }
            let delay = next.min(remaining);
            delays.push(delay);
            spent += delay;
            next = next.saturating_mul(2);
        }
        delays
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy
/// is exhausted. `op` receives the 1-based attempt number.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = policy.delays().into_iter();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) => {
                let Some(delay) = delays.next() else {
                    debug!(attempt, "Retry budget exhausted");
                    return Err(e);
                };
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.start, ms(100));
        assert_eq!(policy.expiry, ms(10_000));
    }

    #[test]
    fn test_delays_double_from_start() {
        let policy = RetryPolicy::new(5, ms(100), ms(10_000));
        assert_eq!(policy.delays(), vec![ms(100), ms(200), ms(400), ms(800)]);
    }

    #[test]
    fn test_delays_truncated_by_expiry() {
        let policy = RetryPolicy::new(10, ms(100), ms(500));
        // 100 + 200 = 300, then 400 is cut to the remaining 200.
        assert_eq!(policy.delays(), vec![ms(100), ms(200), ms(200)]);
    }

    #[test]
    fn test_single_attempt_has_no_delays() {
        assert!(RetryPolicy::new(1, ms(100), ms(1000)).delays().is_empty());
        assert!(RetryPolicy::new(0, ms(100), ms(1000)).delays().is_empty());
        assert!(RetryPolicy::new(3, ms(100), Duration::ZERO).delays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backoff_attempt_timing() {
        let policy = RetryPolicy::new(3, ms(100), ms(10_000));
        let start = Instant::now();
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&attempts);
        let result: Result<(), String> = with_backoff(
            &policy,
            |_| true,
            |attempt| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().unwrap().push((attempt, start.elapsed()));
                    Err("connection refused".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        let attempts = attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 3);
        for ((attempt, elapsed), (expected_attempt, expected)) in
            attempts.into_iter().zip([(1, ms(0)), (2, ms(100)), (3, ms(300))])
        {
            assert_eq!(attempt, expected_attempt);
            assert!(elapsed >= expected && elapsed < expected + ms(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backoff_stops_on_success() {
        let policy = RetryPolicy::new(5, ms(10), ms(1000));
        let result: Result<u32, String> = with_backoff(
            &policy,
            |_| true,
            |attempt| async move {
                if attempt < 2 {
                    Err("timeout".to_string())
                } else {
                    Ok(attempt)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backoff_does_not_retry_permanent_errors() {
        let policy = RetryPolicy::new(5, ms(10), ms(1000));
        let calls = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<(), String> = with_backoff(
            &policy,
            |e: &String| e != "rejected",
            |_| {
                let counter = Arc::clone(&counter);
                async move {
                    *counter.lock().unwrap() += 1;
                    Err("rejected".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    proptest! {
        #[test]
        fn prop_delays_respect_attempts_and_expiry(
            attempts in 0u32..20,
            start_ms in 0u64..5_000,
            expiry_ms in 0u64..60_000,
        ) {
            let policy = RetryPolicy::new(attempts, ms(start_ms), ms(expiry_ms));
            let delays = policy.delays();
            let total: Duration = delays.iter().sum();

            prop_assert!(delays.len() as u32 <= attempts.saturating_sub(1));
            prop_assert!(total <= ms(expiry_ms));
        }
    }
}
