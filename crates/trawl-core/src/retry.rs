//! Classified retry with exponential backoff.
//!
//! Wraps a single async operation. Errors are classified into an
//! [`ErrorKind`]; only kinds listed in `retry_on` are retried.
//!
//! # States
//!
//! ```text
//! ATTEMPTING --[ok]--------------------------------> DONE
//! ATTEMPTING --[retryable, budget left]--> BACKOFF --> ATTEMPTING
//! ATTEMPTING --[not retryable | budget spent]------> FAILED
//! ```
//!
//! Nothing is kept between calls to [`RetryPolicy::execute`].

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, ErrorKind};
use crate::util::{jitter, millis};

/// Configuration for retry behaviour.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Ceiling on a single backoff sleep, jitter included.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform jitter added to each backoff.
    pub jitter: Duration,
    /// Error kinds eligible for retry.
    pub retry_on: HashSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(500),
            retry_on: HashSet::from([
                ErrorKind::Timeout,
                ErrorKind::Network,
                ErrorKind::RateLimit,
                ErrorKind::EmptyResult,
            ]),
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }
}

/// What happened on a failed attempt, handed to retry observers.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    /// Zero-based index of the attempt that just failed.
    pub attempt: u32,
    pub kind: ErrorKind,
    pub error: &'a AppError,
    pub delay: Duration,
}

/// Stateless retry executor.
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

    /// Backoff before retry number `attempt + 1` (zero-based):
    /// `min(max_delay, base_delay * multiplier^attempt + jitter)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_multiplier
            .powi(attempt.min(i32::MAX as u32) as i32);
        let base = self.config.base_delay.as_secs_f64() * exp;
        let raw = if base.is_finite() && base < self.config.max_delay.as_secs_f64() {
            Duration::from_secs_f64(base) + jitter(self.config.jitter)
        } else {
            self.config.max_delay
        };
        raw.min(self.config.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a kind outside
    /// `retry_on`, or the retry budget is spent.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.execute_with(operation, |retry| {
            tracing::warn!(
                attempt = retry.attempt + 1,
                kind = %retry.kind,
                delay_ms = millis(retry.delay),
                error = %retry.error,
                "Operation failed, backing off"
            );
        })
        .await
    }

    /// Like [`execute`](Self::execute), calling `on_retry` before each backoff sleep.
    pub async fn execute_with<F, Fut, T, R>(
        &self,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
        R: FnMut(RetryAttempt<'_>),
    {
        let mut attempt: u32 = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let kind = error.kind();
            if !self.config.retry_on.contains(&kind) {
                tracing::debug!(%kind, error = %error, "Error not retryable, failing fast");
                return Err(error);
            }

            let attempts = attempt + 1;
            if attempts > self.config.max_retries {
                return Err(AppError::ExhaustedRetries {
                    attempts,
                    last_error: Box::new(error),
                });
            }

            let delay = self.delay_for_attempt(attempt);
            on_retry(RetryAttempt {
                attempt,
                kind,
                error: &error,
                delay,
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
