//! Circuit breaker for SIEM destinations and other flaky upstreams
//!
//! Three states: closed (normal), open (fail fast), half-open (trial
//! recovery). State and counters live behind one mutex so a transition is
//! atomic with respect to the call result that caused it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Allowing requests
    Closed,
    /// Failing fast without invoking the protected operation
    Open,
    /// Allowing probe requests to test recovery
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in logs and health snapshots.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Observability snapshot, cheap to clone.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,
    /// Closed→Open transitions since construction
    pub trips: u64,
    /// Consecutive failures in the current closed period
    pub consecutive_failures: u32,
    /// Milliseconds until a probe is allowed (0 unless open)
    pub retry_after_ms: u64,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    trips: u64,
}

/// Circuit breaker guarding one named destination.
pub struct CircuitBreaker {
    name: String,
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker from configuration.
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            recovery_timeout: config.recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                trips: 0,
            }),
        }
    }

    /// Check whether a call may proceed.
    ///
    /// In `Open`, fails fast with [`Error::CircuitOpen`] carrying the time
    /// until a probe is allowed. When the recovery timeout has elapsed the
    /// breaker moves to `HalfOpen` and the call proceeds as the probe.
    pub fn try_acquire(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                if elapsed >= self.recovery_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    let remaining = self.recovery_timeout - elapsed;
                    #[allow(clippy::cast_possible_truncation)]
                    Err(Error::CircuitOpen {
                        destination: self.name.clone(),
                        retry_after_ms: remaining.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                debug!(
                    destination = %self.name,
                    successes = inner.half_open_successes,
                    threshold = self.success_threshold,
                    "Probe succeeded in half-open state"
                );
                if inner.half_open_successes >= self.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                warn!(
                    destination = %self.name,
                    failures = inner.consecutive_failures,
                    threshold = self.failure_threshold,
                    "Failure in closed state"
                );
                if inner.consecutive_failures >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(destination = %self.name, "Probe failed, reopening circuit");
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Observability snapshot.
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        let retry_after_ms = if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
            #[allow(clippy::cast_possible_truncation)]
            {
                self.recovery_timeout.saturating_sub(elapsed).as_millis() as u64
            }
        } else {
            0
        };
        CircuitStats {
            state: inner.state,
            trips: inner.trips,
            consecutive_failures: inner.consecutive_failures,
            retry_after_ms,
        }
    }

    fn transition(&self, inner: &mut BreakerState, new_state: CircuitState) {
        if inner.state == new_state {
            return;
        }
        let old_state = inner.state;
        inner.state = new_state;

        match new_state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                inner.opened_at = None;
                info!(
                    destination = %self.name,
                    from = old_state.as_str(),
                    "Circuit breaker closed"
                );
            }
            CircuitState::Open => {
                inner.trips += 1;
                inner.opened_at = Some(Instant::now());
                warn!(
                    destination = %self.name,
                    from = old_state.as_str(),
                    failures = inner.consecutive_failures,
                    trips = inner.trips,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                debug!(
                    destination = %self.name,
                    from = old_state.as_str(),
                    "Circuit breaker half-open"
                );
            }
        }
    }
}
