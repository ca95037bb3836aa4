//! Retry with exponential backoff.
//!
//! Used by the client SDK for agent-to-agent calls; providers never retry
//! on their own.  The backoff doubles per attempt from the initial delay up
//! to a cap, with a little jitter so a fleet of callers does not retry in
//! lockstep.  Errors whose kind cannot heal (invalid input, unauthorized)
//! abort immediately.

use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::time::sleep;

use crate::agentkit::error::Result;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling on the per-attempt delay.
    pub max_delay: Duration,
    /// Backoff multiplier per attempt.
    pub backoff_multiplier: f64,
    /// Jitter fraction in `[0.0, 1.0]` applied around the computed delay.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        RetryConfig::default()
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay ceiling.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter fraction, clamped to `[0.0, 1.0]`.
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after `attempt` failures (zero-based), with
    /// exponential backoff, cap, and jitter applied.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let exponential = base * self.backoff_multiplier.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range - jitter_range / 2.0;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Run an async operation, retrying retryable failures with backoff.
///
/// Returns the first success, or the last error once the attempt budget is
/// spent or a non-retryable error appears.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt + 1 >= attempts {
                    return Err(err);
                }
                let delay = config.delay_for_attempt(attempt);
                debug!(
                    "attempt {}/{} failed ({err}), retrying in {delay:?}",
                    attempt + 1,
                    attempts
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
