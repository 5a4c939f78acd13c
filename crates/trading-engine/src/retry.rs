//! Bounded, timed retries for broker calls.

use market_core::config::EngineConfig;
use market_core::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Per-call timeout and exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            timeout: Duration::from_millis(config.request_timeout_ms),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Single attempt, no backoff.
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            timeout,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the zero-based `attempt` fails: base * 2^attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `call` until it succeeds, fails permanently, or attempts run out.
///
/// Each attempt is bounded by the policy timeout. Only transient errors
/// (see [`Error::is_transient`]) are retried.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        let error = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_transient() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => Error::Timeout {
                operation: operation.to_string(),
                elapsed_ms: policy.timeout.as_millis() as u64,
            },
        };

        warn!(
            attempt = attempt + 1,
            max_attempts = attempts,
            operation = operation,
            error = %error,
            "Broker call failed"
        );
        last_error = Some(error);

        if attempt + 1 < attempts {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }

    Err(last_error.unwrap_or_else(|| Error::broker(format!("{} never attempted", operation))))
}
