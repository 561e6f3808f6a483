//! Retry with exponential backoff for storage operations
//!
//! Only transient failures (see [`Error::is_retryable`]) are retried. The
//! delay before retry `n` (0-based) is `base_delay * multiplier^n`, with no
//! jitter, and at most `max_retries` retries follow the first attempt.

use backoff::backoff::Backoff;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Upper bound on a single backoff sleep
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Reusable retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            config.backoff_factor,
        )
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, 1.0)
    }

    /// Delay slept before retry number `attempt` (0-based), capped at
    /// [`MAX_RETRY_DELAY`]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }

    /// Run `op` until it succeeds, fails permanently, runs out of retries,
    /// or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let schedule = Schedule::new(self.clone());
        let retried = backoff::future::retry_notify(
            schedule,
            || {
                let attempt = op();
                async move {
                    attempt.await.map_err(|e| {
                        if e.is_retryable() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: Error, delay: Duration| {
                warn!(
                    operation = operation,
                    delay_ms = delay.as_millis() as u64,
                    "Transient storage error, retrying: {}",
                    e
                );
            },
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(operation = operation, "Retry sequence abandoned on shutdown");
                Err(Error::Cancelled)
            }
            result = retried => result.inspect_err(|e| {
                if e.is_retryable() {
                    error!(
                        operation = operation,
                        attempts = self.max_retries + 1,
                        "Storage operation failed after retries: {}",
                        e
                    );
                }
            }),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Bounded exponential schedule fed to `backoff`
struct Schedule {
    policy: RetryPolicy,
    attempt: u32,
}

impl Schedule {
    fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }
}

impl Backoff for Schedule {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}
