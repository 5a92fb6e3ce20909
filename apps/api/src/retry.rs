//! Retry policy shared by every component that owns an external call.
//!
//! Callers either hand the policy an async closure (`run`) or drive their own
//! loop with `should_retry` / `delay_for` when they need to record each attempt
//! (the deployment orchestrator does this to keep its operation log).

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::cancel::CancelFlag;
use crate::errors::AppError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Backoff before retry number `retry` (1-based): base, 2×base, 4×base, … capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Whether `attempt` (1-based) failing with `error` should be followed by another.
    pub fn should_retry(&self, attempt: u32, error: &AppError) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or attempts
    /// are exhausted. The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        op_name: &str,
        cancel: Option<&CancelFlag>,
        mut op: F,
    ) -> Result<T, AppError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 1;
        loop {
            if let Some(flag) = cancel {
                flag.check()?;
            }
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, &e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{op_name} attempt {attempt}/{} failed: {e}; retrying in {}ms",
                        self.max_attempts,
                        delay.as_millis()
                    );
                    match cancel {
                        Some(flag) => flag.sleep(delay).await?,
                        None => tokio::time::sleep(delay).await,
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Bounds a single external call, mapping an elapsed budget to a retryable error.
pub async fn with_timeout<T, Fut>(
    dependency: &'static str,
    budget: Duration,
    fut: Fut,
) -> Result<T, AppError>
where
    Fut: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::timeout(dependency, budget)),
    }
}
