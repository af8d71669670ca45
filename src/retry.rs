//! Backoff schedules with jitter.
//!
//! [`Backoff`] produces the delays used by the completion tracker's fallback
//! polling, [`RetryConfig::delay_for`] gives the requeue delay after a failed
//! reconcile, and [`retry_with_backoff`] wraps one-off startup calls.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Exponential backoff configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config bounded between `initial` and `max` delays
    pub fn bounded(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            ..Default::default()
        }
    }

    /// Deterministic delay before the attempt following `failures` failures
    ///
    /// `initial * multiplier^failures`, capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(failures.min(i32::MAX as u32) as i32);
        let nanos = self.initial_delay.as_nanos() as f64 * exp;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

/// Stateful jittered exponential backoff
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
}

impl Backoff {
    /// Start a new schedule at the configured initial delay
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            failures: 0,
        }
    }

    /// Next delay, jittered to 0.5x-1.5x and never above `max_delay`
    pub fn next_delay(&mut self) -> Duration {
        let base = self.config.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(base.as_secs_f64() * jitter);
        jittered.min(self.config.max_delay)
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = backoff.next_delay();
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
