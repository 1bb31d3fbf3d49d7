//! Exponential backoff with symmetric jitter for retryable single calls.
//!
//! Handles transient blips of one call; sustained degradation is the
//! breaker's job. Permanent errors and budget vetoes are never retried.

use std::future::Future;
use std::time::Duration;

use bidguard_core::config::RetryConfig;
use bidguard_core::{GuardResult, Retryable};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    #[error("permanent failure: {0}")]
    Permanent(E),

    #[error("retries exhausted: {0}")]
    Exhausted(E),

    /// Cancelled before or between attempts; carries the last error seen, if any.
    #[error("retry cancelled")]
    Cancelled(Option<E>),
}

impl<E> RetryError<E> {
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Permanent(e) | RetryError::Exhausted(e) => Some(e),
            RetryError::Cancelled(e) => e.as_ref(),
        }
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, RetryError<E>>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_validated(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> GuardResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    fn from_validated(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            jitter_fraction: config.jitter_fraction,
        }
    }

    /// `min(initial * multiplier^(attempt-1), max)` for the 1-based `attempt` that just failed.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped_ms.max(0.0).round() as u64)
    }

    /// Base backoff plus `±base * jitter_fraction * U(-1, 1)`, floored at zero.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if self.jitter_fraction <= 0.0 {
            return base;
        }
        let base_secs = base.as_secs_f64();
        let unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let jittered = base_secs + base_secs * self.jitter_fraction * unit;
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts or
    /// `cancel` fires. Cancellation is observed before each attempt and during
    /// the backoff sleep.
    pub async fn execute_with_retry<T, E, Op, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut op: Op,
        is_retryable: R,
    ) -> RetryOutcome<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempts = 0u32;
        let mut last_error: Option<E> = None;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(RetryError::Cancelled(last_error)),
                    attempts,
                };
            }

            attempts += 1;
            let err = match op().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(e) => e,
            };

            if !is_retryable(&err) {
                debug!(attempts, error = %err, "permanent failure, not retrying");
                return RetryOutcome {
                    result: Err(RetryError::Permanent(err)),
                    attempts,
                };
            }
            if attempts >= self.max_attempts {
                warn!(attempts, error = %err, "retries exhausted");
                return RetryOutcome {
                    result: Err(RetryError::Exhausted(err)),
                    attempts,
                };
            }

            let delay = self.backoff_for_attempt(attempts);
            debug!(attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying after backoff");
            last_error = Some(err);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(RetryError::Cancelled(last_error)),
                        attempts,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// `execute_with_retry` with the error type's own classification.
    pub async fn execute<T, E, Op, Fut>(&self, cancel: &CancellationToken, op: Op) -> RetryOutcome<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        self.execute_with_retry(cancel, op, |e: &E| e.is_retryable())
            .await
    }
}
