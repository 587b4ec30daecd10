//! Retry configuration and exponential backoff logic.
//!
//! This module provides the [`RetryConfig`] type, the stateful [`Backoff`]
//! used by the long-running receive loops, and the [`retry_with_backoff`]
//! helper used by the [`ScaleMonitor`](crate::ScaleMonitor) for one-shot
//! broker queries.
//!
//! # Retry Strategy
//!
//! - Only retries broker errors whose classification says
//!   [`should_retry`](crate::BrokerError::should_retry)
//! - Uses exponential backoff with randomized jitter to prevent thundering herd
//! - Caps delay at `max_delay` to prevent excessive wait times
//! - Receive loops never give up: they call [`Backoff::next_delay`] after each
//!   failure and [`Backoff::reset`] after the next success

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::{
    // ---
    options::timespan,
    BrokerResult,
};

/// Retry configuration with exponential backoff.
///
/// Used as-is by [`retry_with_backoff`]. The receive loops only take the
/// delay settings from it; `max_attempts` does not apply to them because a
/// listener keeps receiving until it is stopped.
///
/// Configure through [`ListenerOptions::receive_retry`](crate::ListenerOptions::receive_retry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    ///
    /// Example: 2.0 doubles the delay each time (exponential backoff).
    pub multiplier: f32,

    /// Initial delay before the first retry.
    #[serde(with = "timespan")]
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    #[serde(with = "timespan")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// Reasonable default retry configuration.
    ///
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0 (exponential backoff)
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Stateful backoff for loops that retry indefinitely.
///
/// Each call to [`next_delay`](Self::next_delay) returns the current delay
/// (with jitter) and grows the next one by `multiplier`, capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
    failures: u32,
}

impl Backoff {
    // ---
    pub fn new(config: RetryConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            failures: 0,
        }
    }

    /// Delay to wait after the latest failure.
    pub fn next_delay(&mut self) -> Duration {
        // ---
        self.failures = self.failures.saturating_add(1);
        let delay = apply_jitter(self.current);
        let next =
            Duration::from_secs_f64(self.current.as_secs_f64() * self.config.multiplier as f64);
        self.current = next.min(self.config.max_delay);
        delay.min(self.config.max_delay)
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.failures = 0;
    }
}

/// Retry an async broker call with exponential backoff.
///
/// Executes the provided operation and retries it according to the retry
/// configuration if it fails with a retryable error. Non-retryable errors
/// cause immediate failure. If `retry_config` is `None`, the operation
/// executes exactly once.
///
/// # Backoff Algorithm
///
/// - First retry: `initial_delay` (with jitter)
/// - Subsequent retries: `min(current_delay * multiplier, max_delay)` (with jitter)
/// - Jitter: ±25% randomization to prevent synchronized retries
///
/// # Returns
///
/// - `Ok(T)` if the operation succeeds (on any attempt)
/// - `Err(BrokerError)` if all retry attempts are exhausted or a non-retryable error occurs
///
/// # Example
///
/// ```ignore
/// let props = retry_with_backoff(Some(&retry), || async {
///     receiver.entity_properties().await
/// }).await?;
/// ```
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    retry_config: Option<&RetryConfig>,
    mut operation: F,
) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let retry_config = match retry_config {
        Some(cfg) => cfg,
        None => {
            return operation().await;
        }
    };

    let mut backoff = Backoff::new(retry_config.clone());

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if err.should_retry() => {
                if backoff.failures() >= retry_config.max_attempts {
                    crate::log_debug!(
                        "retry exhausted after {} attempts, last error: {}",
                        retry_config.max_attempts,
                        err
                    );
                    return Err(err);
                }

                let delay = backoff.next_delay();

                crate::log_debug!(
                    "retry attempt {}/{}, waiting {:?} before retry (error: {})",
                    backoff.failures(),
                    retry_config.max_attempts,
                    delay,
                    err
                );

                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Apply ±25% jitter to a duration to prevent thundering herd.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::BrokerError;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_no_retry_on_success() {
        // ---
        let config = RetryConfig::default();
        let call_count = Arc::new(Mutex::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(Some(&config), || {
            let count = call_count_clone.clone();
            async move {
                *count.lock().unwrap() += 1;
                Ok::<i32, BrokerError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*call_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_none_config_executes_once() {
        // ---
        let call_count = Arc::new(Mutex::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(None, || {
            let count = call_count_clone.clone();
            async move {
                *count.lock().unwrap() += 1;
                Err::<i32, _>(BrokerError::transient("fail"))
            }
        })
        .await;

        assert!(result.unwrap_err().should_retry());
        assert_eq!(*call_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_on_transient_error() {
        // ---
        let call_count = Arc::new(Mutex::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(Some(&fast_config(3)), || {
            let count = call_count_clone.clone();
            async move {
                let attempt = {
                    let mut c = count.lock().unwrap();
                    *c += 1;
                    *c
                };

                if attempt < 3 {
                    Err(BrokerError::transient("simulated failure"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*call_count.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        // ---
        let call_count = Arc::new(Mutex::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(Some(&fast_config(2)), || {
            let count = call_count_clone.clone();
            async move {
                *count.lock().unwrap() += 1;
                Err::<i32, _>(BrokerError::timeout("always fails"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_timeout());
        // Initial attempt + 2 retries = 3 total calls
        assert_eq!(*call_count.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_lock_lost() {
        // ---
        let call_count = Arc::new(Mutex::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(Some(&RetryConfig::default()), || {
            let count = call_count_clone.clone();
            async move {
                *count.lock().unwrap() += 1;
                Err::<i32, _>(BrokerError::lock_lost("gone"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_lock_lost());
        assert_eq!(*call_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_max_delay_cap() {
        // ---
        let retry_config = RetryConfig {
            max_attempts: 5,
            multiplier: 10.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        let start = Instant::now();

        let _result = retry_with_backoff(Some(&retry_config), || async {
            Err::<i32, _>(BrokerError::transient("test"))
        })
        .await;

        // 10ms + 4 * 50ms at most, plus scheduling slack
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(400),
            "max_delay cap not working: {elapsed:?}",
        );
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        // ---
        let mut backoff = Backoff::new(RetryConfig {
            max_attempts: 0,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        });

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(150) && second <= Duration::from_millis(250));

        // capped from here on
        for _ in 0..5 {
            assert!(backoff.next_delay() <= Duration::from_millis(300));
        }
        assert_eq!(backoff.failures(), 7);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(125));
    }

    #[test]
    fn test_jitter_range() {
        // ---
        let delay = Duration::from_millis(100);

        for _ in 0..100 {
            let jittered = apply_jitter(delay);
            assert!(
                jittered >= Duration::from_millis(75),
                "jitter too low: {jittered:?}",
            );
            assert!(
                jittered <= Duration::from_millis(125),
                "jitter too high: {jittered:?}",
            );
        }
    }
}
