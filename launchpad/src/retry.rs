//! Bounded retries for calls to external collaborators.
//!
//! Every attempt runs under a timeout. Failures that classify themselves as transient are retried
//! with exponential backoff until the attempt budget runs out; anything else is returned at once.

use crate::conf;
use std::{fmt::Display, future::Future, time::Duration};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never less than one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,

    /// How long a single attempt may take before it's abandoned and counted as a transient failure.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&conf::api::Retry> for RetryPolicy {
    fn from(config: &conf::api::Retry) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (zero based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped_delay = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_delay)
    }
}

/// Lets the retry loop tell failures worth another attempt from ones that will never succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// An attempt that ran past its deadline. Whatever the callee was doing may or may not have
/// happened on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{operation}' did not finish within {}ms", .timeout.as_millis())]
pub struct TimedOut {
    pub operation: String,
    pub timeout: Duration,
}

/// Runs `attempt` until it succeeds, fails fatally, or the policy's attempt budget is spent. The
/// last error is returned as is.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut attempt: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + From<TimedOut> + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts_made = 0;

    loop {
        attempts_made += 1;

        let result = match tokio::time::timeout(policy.attempt_timeout, attempt()).await {
            Ok(result) => result,
            Err(_) => Err(E::from(TimedOut {
                operation: operation.to_string(),
                timeout: policy.attempt_timeout,
            })),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() || attempts_made >= max_attempts {
            return Err(err);
        }

        let delay = policy.backoff(attempts_made - 1);

        warn!(
            operation = operation,
            attempt = attempts_made,
            max_attempts = max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed; retrying"
        );

        tokio::time::sleep(delay).await;
    }
}
