//! Retry and backoff policies.
//!
//! Two flavours of recovery live here:
//!
//! - [`RetryPolicy`] with [`retry_with_policy`]: a bounded number of attempts with a
//!   fixed delay. Used where giving up is the correct outcome, e.g. snapshot capture
//!   at the end of a scan.
//! - [`BackoffPolicy`] with [`Backoff`]: unbounded exponential backoff capped at a
//!   maximum interval. Used by the polling engine, for which communication loss is
//!   never fatal.

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    #[serde(with = "humantime_serde")]
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Outcome of an exhausted retry loop.
#[derive(Debug)]
pub struct RetriesExhausted {
    /// Attempts made
    pub attempts: u32,
    /// Error from the final attempt
    pub last_error: DaqError,
}

/// Runs `operation` until it succeeds or the policy's attempts are used up.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetriesExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DaqError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => {
                return Err(RetriesExhausted {
                    attempts: attempt,
                    last_error: err,
                })
            }
            Err(err) => {
                debug!(attempt, max_attempts, error = %err, "attempt failed, retrying");
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after a success; normally the polling period.
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Upper bound for the delay.
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Backoff state for one polling loop.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    /// Start at the base interval.
    pub fn new(policy: BackoffPolicy) -> Self {
        let current = policy.base;
        Self {
            policy,
            current,
            consecutive_failures: 0,
        }
    }

    /// Delay before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a failure and return the grown delay.
    pub fn on_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let grown = self.current.as_secs_f64() * self.policy.multiplier.max(1.0);
        let capped = grown.min(self.policy.max.as_secs_f64());
        self.current = Duration::from_secs_f64(capped).max(self.policy.base.min(self.policy.max));
        self.current
    }

    /// Record a success; the delay drops back to the base interval.
    pub fn on_success(&mut self) -> Duration {
        self.consecutive_failures = 0;
        self.current = self.policy.base;
        self.current
    }
}
