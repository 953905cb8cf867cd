//! Retry eligibility and exponential backoff.
//!
//! A failed attempt is retried only when `attempt < max_attempts` and the
//! failure is either an HTTP status accepted by the retry predicate (429 and
//! 5xx by default) or a transient transport error. Cancellations are never
//! retried. The delay before attempt `n + 1` is
//! `min(base_delay * backoff_factor^(n - 1), max_delay)`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{LoaderError, Result};

/// Decides whether an HTTP status code is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Retry 429 (Too Many Requests) and every 5xx status.
pub fn default_retry_predicate(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Retry configuration
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub retry_predicate: RetryPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            retry_predicate: Arc::new(default_retry_predicate),
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .finish_non_exhaustive()
    }
}

/// Retry policy applied around every network request.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Check whether attempt number `attempt` (1-based) may be followed by another.
    pub fn should_retry(&self, attempt: u32, error: &LoaderError) -> bool {
        if attempt >= self.config.max_attempts || error.is_cancellation() {
            return false;
        }

        match error {
            LoaderError::Protocol { status, .. } => (self.config.retry_predicate)(*status),
            other => other.is_transient_transport(),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.config.base_delay.as_millis() as f64
            * self.config.backoff_factor.powi(exponent);
        let cap = self.config.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(millis.max(0.0) / 1000.0)
    }

    /// Run `operation` until it succeeds, fails permanently or is cancelled.
    ///
    /// The operation receives the 1-based attempt number. Cancellation is
    /// observed both while an attempt is in flight and during backoff, and
    /// stops further attempts immediately. When attempts are exhausted the
    /// last error is returned.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(LoaderError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LoaderError::Cancelled),
                result = operation(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.should_retry(attempt, &error) {
                if attempt > 1 {
                    debug!(attempt, error = %error, "Giving up after retries");
                }
                return Err(error);
            }

            let delay = self.delay(attempt);
            warn!(
                attempt,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Request failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LoaderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
