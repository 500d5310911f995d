//! Circuit breaker for outbound destinations.
//!
//! One breaker instance guards one destination (broker or dead-letter
//! sink). Repeated failures open the circuit so callers fail fast instead
//! of piling onto a degraded endpoint; a half-open trial probes for
//! recovery after the reset timeout.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use weir_core::{Error, Result};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Sends flow normally.
    Closed,
    /// Sends are rejected without a network call.
    Open,
    /// One trial send is allowed to probe recovery.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Cumulative breaker counters.
#[derive(Debug, Default)]
pub struct BreakerMetrics {
    /// Sends rejected while the circuit was open
    pub rejected: AtomicU64,
    /// Transitions into the open state
    pub opened: AtomicU64,
    /// Half-open trials that closed the circuit
    pub recovered: AtomicU64,
}

/// Per-destination circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
    metrics: BreakerMetrics,
}

impl CircuitBreaker {
    /// Create a closed breaker for the named destination.
    #[must_use]
    pub fn new(destination: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            destination: destination.into(),
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(Inner::Closed { consecutive_failures: 0 }),
            metrics: BreakerMetrics::default(),
        }
    }

    /// Name of the guarded destination.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Current observable state. For metrics only; admission decisions go
    /// through [`try_admit`](Self::try_admit).
    #[must_use]
    pub fn state(&self) -> BreakerState {
        match *self.inner.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Ask permission for one send attempt.
    ///
    /// # Errors
    /// Returns [`Error::CircuitOpen`] while the circuit is open, and while a
    /// half-open trial is already in flight.
    pub fn try_admit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_timeout {
                    debug!(destination = %self.destination, "circuit half-open, admitting trial send");
                    *inner = Inner::HalfOpen { trial_in_flight: true };
                    Ok(())
                } else {
                    self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(Error::CircuitOpen { destination: self.destination.clone() })
                }
            },
            Inner::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(Error::CircuitOpen { destination: self.destination.clone() })
                } else {
                    *inner = Inner::HalfOpen { trial_in_flight: true };
                    Ok(())
                }
            },
        }
    }

    /// Report a successful send.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::HalfOpen { .. } => {
                self.metrics.recovered.fetch_add(1, Ordering::Relaxed);
                debug!(destination = %self.destination, "circuit closed after successful trial");
                *inner = Inner::Closed { consecutive_failures: 0 };
            },
            Inner::Closed { ref mut consecutive_failures } => {
                *consecutive_failures = 0;
            },
            Inner::Open { .. } => {},
        }
    }

    /// Report a failed send.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed { consecutive_failures } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    self.metrics.opened.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        destination = %self.destination,
                        failures,
                        "circuit opened after consecutive send failures"
                    );
                    *inner = Inner::Open { opened_at: Instant::now() };
                } else {
                    *inner = Inner::Closed { consecutive_failures: failures };
                }
            },
            Inner::HalfOpen { .. } => {
                self.metrics.opened.fetch_add(1, Ordering::Relaxed);
                warn!(destination = %self.destination, "trial send failed, circuit reopened");
                *inner = Inner::Open { opened_at: Instant::now() };
            },
            Inner::Open { .. } => {},
        }
    }

    /// Sends rejected while the circuit was open.
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.metrics.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new("test-sink", threshold, reset)
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let breaker = breaker(3, Duration::from_secs(30));
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_admit().is_ok());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = breaker(3, Duration::from_secs(30));
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_opens_at_threshold_and_rejects() {
        let breaker = breaker(5, Duration::from_secs(30));
        for _ in 0..5 {
            assert!(breaker.try_admit().is_ok());
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = breaker.try_admit().unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(breaker.rejected_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout() {
        let breaker = breaker(1, Duration::from_secs(30));
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        // First admission after the timeout is the half-open trial.
        assert!(breaker.try_admit().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Only one trial may be in flight.
        assert!(breaker.try_admit().is_err());

        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker(1, Duration::from_secs(10));
        breaker.on_failure();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.try_admit().is_ok());
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Timeout restarts: still rejecting shortly after the failed trial.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breaker.try_admit().is_err());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(breaker.try_admit().is_ok());
    }
}
