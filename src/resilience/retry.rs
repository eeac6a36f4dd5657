// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry and backoff.
//!
//! Two concerns live here:
//! - [`BackoffPolicy`]: how long a transiently failed record waits before the
//!   orchestrator may submit it again.
//! - [`retry`]: in-process retry of local persistence calls (SQLite busy,
//!   pool exhaustion) with [`RetryConfig`] presets.
//!
//! # Example
//!
//! ```
//! use fleet_sync::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy {
//!     base_delay: Duration::from_secs(1),
//!     max_delay: Duration::from_secs(60),
//!     jitter: 0.0,
//! };
//!
//! assert_eq!(policy.delay_for(1), Duration::from_secs(2));
//! assert_eq!(policy.delay_for(2), Duration::from_secs(4));
//! assert_eq!(policy.delay_for(10), Duration::from_secs(60)); // capped
//!
//! // A larger Retry-After wins
//! let d = policy.next_delay(1, Some(Duration::from_secs(90)));
//! assert_eq!(d, Duration::from_secs(90));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

/// Exponential backoff for record resubmission: `min(base * 2^attempts, max)`,
/// with a random fraction (up to `jitter`) shaved off.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0.0 ..= [`Self::MAX_JITTER`]
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Above this, a jittered delay could undercut the previous attempt's.
    pub const MAX_JITTER: f64 = 0.5;

    /// Jittered delay after the `attempts`-th failure.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let unit = if self.jitter > 0.0 { rand::thread_rng().gen::<f64>() } else { 0.0 };
        self.delay_with(attempts, unit)
    }

    /// Deterministic form of [`delay_for`](Self::delay_for); `unit` in `[0, 1)`
    /// selects how much of the jitter window is applied.
    #[must_use]
    pub fn delay_with(&self, attempts: u32, unit: f64) -> Duration {
        let factor = 2f64.powi(attempts.min(30) as i32);
        let raw = self.base_delay.as_secs_f64() * factor;
        let jitter = self.jitter.clamp(0.0, Self::MAX_JITTER) * unit.clamp(0.0, 1.0);
        let jittered = raw * (1.0 - jitter);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    /// Backoff honoring a server `Retry-After` when it is larger.
    #[must_use]
    pub fn next_delay(&self, attempts: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.delay_for(attempts);
        match retry_after {
            Some(ra) if ra > backoff => ra,
            _ => backoff,
        }
    }
}

/// Retry behavior for local persistence calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Opening the store: a few patient attempts, then surface the error.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Individual reads and writes. The caller is waiting.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Run `operation` until it succeeds or `config.max_retries` attempts fail.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if attempts >= config.max_retries {
                    return Err(err);
                }

                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = config.max_retries,
                    error = %err,
                    retry_in = ?delay,
                    "Operation failed, retrying"
                );

                sleep(delay).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter,
        }
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let p = policy(0.0);
        assert_eq!(p.delay_for(0), Duration::from_millis(500));
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let p = policy(0.0);
        assert_eq!(p.delay_for(8), Duration::from_secs(30));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jittered_delays_strictly_increase() {
        let p = policy(BackoffPolicy::MAX_JITTER);
        // Worst case: previous attempt un-jittered, next fully jittered
        for attempts in 1..5 {
            let prev_max = p.delay_with(attempts, 0.0);
            let next_min = p.delay_with(attempts + 1, 0.999_999);
            assert!(next_min > prev_max, "attempt {attempts}: {next_min:?} <= {prev_max:?}");
        }
    }

    #[test]
    fn test_jitter_stays_within_window() {
        let p = policy(0.2);
        for _ in 0..100 {
            let d = p.delay_for(2);
            assert!(d <= Duration::from_secs(2));
            assert!(d >= Duration::from_millis(1_600));
        }
    }

    #[test]
    fn test_retry_after_only_when_larger() {
        let p = policy(0.0);
        assert_eq!(p.next_delay(1, Some(Duration::from_millis(10))), Duration::from_secs(1));
        assert_eq!(p.next_delay(1, Some(Duration::from_secs(45))), Duration::from_secs(45));
        assert_eq!(p.next_delay(1, None), Duration::from_secs(1));
    }

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("busy {count}")))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(TestError("locked".to_string()))
            }
        })
        .await;

        assert!(result.unwrap_err().0.contains("locked"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
