//! Retry with exponential backoff for non-streaming model calls.
//!
//! Streaming calls are never retried here: once deltas have reached the
//! client, a second attempt would duplicate output.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use skein_config::RetryConfig;
use skein_core::error::ProviderError;
use tracing::{debug, warn};

/// Substrings that mark a failure as a transient network problem.
const TRANSIENT_PATTERNS: &[&str] = &[
    "fetch failed",
    "network error",
    "econnreset",
    "econnrefused",
    "etimedout",
    "socket hang up",
    "connection reset",
    "connection refused",
    "timed out",
    "failed to fetch",
    "network request failed",
];

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based): `base * 2^(retry - 1)`.
    pub fn delay_before(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exp)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, is_retryable: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = self.delay_before(attempt);
                debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Retrying after backoff");
                tokio::time::sleep(delay).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < attempts && is_retryable(&err) => {
                    warn!(attempt = attempt + 1, error = %err, "Transient failure, will retry");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Retry `op` with the default policy (3 attempts, 500ms then 1000ms).
pub async fn with_retry<T, E, F, Fut, C>(op: F, is_retryable: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: Display,
{
    RetryPolicy::default().run(op, is_retryable).await
}

/// Is this provider failure worth another attempt?
///
/// Errors carrying a status code are retryable only for 429 and 5xx.
/// Everything else is judged by its message.
pub fn is_retryable_llm_error(err: &ProviderError) -> bool {
    if matches!(err, ProviderError::Cancelled) {
        return false;
    }
    match err.status_code() {
        Some(status) => status == 429 || status >= 500,
        None => is_transient_message(&err.to_string()),
    }
}

/// Does this message look like a transient network failure?
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}
