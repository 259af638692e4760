//! Exponential backoff and retry.
//!
//! [`BackoffPolicy`] computes the delay before retry `n` as
//! `first × factor^n`, capped at `max`, then applies jitter. The base delay
//! depends only on the attempt number, so jitter never feeds back into later
//! delays.
//!
//! [`RetryPolicy`] drives an async operation with that backoff, retrying only
//! errors the caller classifies as transient. When attempts run out, the
//! caller sees the last error unchanged.
//!
//! Used for worker spawn attempts and for forwarded HTTP requests.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

/// Randomisation applied to a backoff delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Jitter {
    /// Use the computed delay as is.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`.
    Equal,
}

impl Jitter {
    /// Applies the jitter to a delay.
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self {
            Self::None => delay,
            Self::Full => Duration::from_millis(rng.gen_range(0..=ms)),
            Self::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.gen_range(0..=half))
            }
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(with = "crate::config::serde_duration_millis")]
    pub first: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "crate::config::serde_duration_millis")]
    pub max: Duration,
    /// Growth factor between attempts.
    pub factor: f64,
    /// Jitter applied after capping.
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: Jitter::None,
        }
    }
}

impl BackoffPolicy {
    /// Exponential policy without jitter.
    #[must_use]
    pub const fn exponential(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
            jitter: Jitter::None,
        }
    }

    /// Returns a copy with the given jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn next(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.factor.powi(exponent);

        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_nanos((secs * 1e9).round() as u64)
        };
        self.jitter.apply(base)
    }
}

/// Bounded retry driven by a [`BackoffPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay schedule between attempts.
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
    /// Total attempts including the first. Zero behaves like one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(backoff: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts,
        }
    }

    /// Runs `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `operation` receives the 0-indexed attempt number. Errors for which
    /// `is_transient` returns false are returned immediately.
    pub async fn retry<T, E, F, Fut, C>(&self, name: &str, mut operation: F, is_transient: C) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt + 1 < max_attempts && is_transient(&e) => {
                    let delay = self.backoff.next(attempt);
                    warn!(
                        operation = name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rstest::rstest;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[rstest]
    #[case(0, 50)]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 250)]
    #[case(10, 250)]
    fn delays_double_until_capped(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = BackoffPolicy::exponential(Duration::from_millis(50), Duration::from_millis(250));
        assert_eq!(policy.next(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn overflow_clamps_to_max() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(5));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn first_above_max_is_capped() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(policy.next(0), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            assert!(Jitter::Full.apply(base) <= base);
            let equal = Jitter::Equal.apply(base);
            assert!(equal >= Duration::from_millis(500) && equal <= base);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_with_backoff() {
        let policy = RetryPolicy::new(
            BackoffPolicy::exponential(Duration::from_millis(50), Duration::from_millis(250)),
            4,
        );
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let recorded = attempts.clone();
        let result: Result<&str, String> = policy
            .retry(
                "test",
                |attempt| {
                    let recorded = recorded.clone();
                    async move {
                        recorded.lock().push(Instant::now());
                        if attempt < 3 {
                            Err(format!("transient {attempt}"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        let times = attempts.lock().clone();
        assert_eq!(times.len(), 4);

        let gaps: Vec<u128> = times.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        let expected = [50_u128, 100, 200];
        for (gap, want) in gaps.iter().zip(expected) {
            assert!(gap.abs_diff(want) <= 5, "gap {gap}ms, expected {want}ms");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_original_error() {
        let policy = RetryPolicy::new(
            BackoffPolicy::exponential(Duration::from_millis(10), Duration::from_millis(10)),
            3,
        );
        let calls = Arc::new(Mutex::new(0_u32));

        let counter = calls.clone();
        let result: Result<(), String> = policy
            .retry(
                "test",
                |attempt| {
                    let counter = counter.clone();
                    async move {
                        *counter.lock() += 1;
                        Err(format!("failure {attempt}"))
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(*calls.lock(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(Mutex::new(0_u32));

        let counter = calls.clone();
        let result: Result<(), String> = policy
            .retry(
                "test",
                |_| {
                    let counter = counter.clone();
                    async move {
                        *counter.lock() += 1;
                        Err("fatal".to_owned())
                    }
                },
                |e| e != "fatal",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock(), 1);
    }
}
