//! Failsafe mechanisms: circuit breaker and retry
//!
//! The SIEM forwarder wraps every destination send in a [`Failsafe`]: the
//! breaker fails fast while the destination is down, the retry policy absorbs
//! transient blips.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStats};
pub use retry::{RetryPolicy, is_transient, with_retry};

use std::future::Future;
use std::sync::Arc;

use crate::config::FailsafeConfig;
use crate::{Error, Result};

/// Combined failsafe wrapper for one destination
#[derive(Clone)]
pub struct Failsafe {
    /// Circuit breaker
    pub circuit_breaker: Arc<CircuitBreaker>,
    /// Retry policy
    pub retry_policy: RetryPolicy,
}

impl Failsafe {
    /// Create a failsafe from configuration, named after the destination.
    #[must_use]
    pub fn new(name: &str, config: &FailsafeConfig) -> Self {
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::new(name, &config.circuit_breaker)),
            retry_policy: RetryPolicy::new(&config.retry),
        }
    }

    /// Run `f` behind the breaker with retries.
    ///
    /// The breaker is consulted once per attempt so that a circuit opening
    /// mid-retry stops the remaining attempts, and every attempt's outcome is
    /// recorded against the breaker.
    ///
    /// # Errors
    ///
    /// [`Error::CircuitOpen`] when failing fast, otherwise the last error
    /// from `f`.
    pub async fn call<F, Fut, T>(&self, name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = Arc::clone(&self.circuit_breaker);
        with_retry(&self.retry_policy, name, || {
            let breaker = Arc::clone(&breaker);
            let fut = {
                breaker.try_acquire().map(|()| f())
            };
            async move {
                match fut {
                    Err(e) => Err(e),
                    Ok(inner) => match inner.await {
                        Ok(v) => {
                            breaker.record_success();
                            Ok(v)
                        }
                        Err(e) => {
                            breaker.record_failure();
                            Err(e)
                        }
                    },
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::{CircuitBreakerConfig, RetryConfig};

    fn config(failure_threshold: u32) -> FailsafeConfig {
        FailsafeConfig {
            circuit_breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold,
                success_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
            },
            retry: RetryConfig {
                enabled: true,
                max_attempts: 2,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        }
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_calling() {
        let fs = Failsafe::new("dest", &config(1));
        let calls = AtomicU32::new(0);

        // First call fails and trips the breaker (threshold 1).
        let _ = fs
            .call("send", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::UpstreamUnavailable("down".into()))
            })
            .await;
        let after_first = calls.load(Ordering::SeqCst);

        // Second call must fail fast without invoking the operation.
        let result = fs
            .call("send", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn success_passes_through_and_keeps_circuit_closed() {
        let fs = Failsafe::new("dest", &config(5));
        let result = fs.call("send", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(fs.circuit_breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn each_retry_attempt_is_recorded_against_breaker() {
        // threshold 2, max_attempts 2: one call with two failing attempts
        // should trip the breaker.
        let fs = Failsafe::new("dest", &config(2));
        let _ = fs
            .call("send", || async {
                Err::<(), _>(Error::UpstreamUnavailable("down".into()))
            })
            .await;
        assert_eq!(fs.circuit_breaker.state(), CircuitState::Open);
    }
}
