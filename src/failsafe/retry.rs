//! Retry with bounded exponential backoff and jitter
//!
//! Delay for attempt `n` (0-based) is `base * 2^n` capped at `max_backoff`,
//! plus uniform jitter in `[0, base]` so simultaneous failures don't retry in
//! lockstep. Only transient errors are retried; client-side errors surface
//! immediately.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio::time::sleep;
use tracing::debug;

use crate::Error;
use crate::config::RetryConfig;

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts (first try included)
    pub max_attempts: u32,
    /// Base backoff
    pub base_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
        }
    }

    /// Compute the delay before retrying after attempt `attempt` (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        let jitter_ms = if self.base_backoff.is_zero() {
            0
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let base_ms = self.base_backoff.as_millis() as u64;
            rand::rng().random_range(0..=base_ms)
        };
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Execute a fallible async operation under the retry policy.
///
/// # Errors
///
/// Returns the last error from `f` once attempts are exhausted, or the first
/// error that is not classified as transient.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    if !policy.enabled {
        return f().await;
    }

    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_transient(&e) {
                    return Err(e);
                }

                attempt += 1;
                if attempt >= policy.max_attempts {
                    debug!(operation = name, attempts = attempt, "Retry attempts exhausted");
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    operation = name,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after backoff"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Classify an error as transient (retryable) or terminal.
///
/// Timeouts, connection failures, and 5xx-class upstream errors are
/// transient. Everything user-shaped (4xx analogues: invalid input, auth
/// failures, scope denials) is terminal.
#[must_use]
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::UpstreamUnavailable(_) | Error::Io(_) => true,
        Error::Http(e) => {
            e.is_timeout()
                || e.is_connect()
                || e.status().is_some_and(|s| s.is_server_error())
        }
        _ => false,
    }
}
