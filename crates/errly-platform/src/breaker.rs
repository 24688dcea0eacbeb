//! Circuit breaker for the platform transport.
//!
//! Prevents cascading failures by refusing requests to a failing platform
//! locally. Three states:
//!
//! - **Closed**: normal operation, requests pass through
//! - **Open**: the platform is failing, requests are refused immediately
//! - **HalfOpen**: one probe request tests whether it has recovered
//!
//! Transitions: five consecutive transient failures open the circuit; after
//! the open window elapses the next request is allowed through as a probe;
//! its success closes the circuit, its failure reopens it for another
//! window.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::PlatformError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through.
    Closed,
    /// The platform is failing - requests are refused.
    Open,
    /// Testing recovery - a single probe is allowed.
    HalfOpen,
}

impl CircuitState {
    /// String representation for diagnostics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state circuit breaker.
///
/// Uses `tokio::time::Instant` so the open window follows the tokio clock
/// (and therefore paused-clock tests).
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Check whether a request may be issued.
    ///
    /// In the open state this transitions to half-open once the window has
    /// elapsed, allowing exactly one probe through.
    pub fn allow_request(&self) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |at| at.elapsed());
                if elapsed >= self.config.open_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!("circuit breaker transitioning to half-open");
                    Ok(())
                } else {
                    Err(PlatformError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(PlatformError::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                tracing::info!("circuit breaker closed after successful probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Record a transient failure.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                tracing::warn!("circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Return an unresolved probe to the pool.
    ///
    /// For a granted request that was short-circuited before reaching the
    /// wire (auth latch, rate limit): the probe counts as neither success
    /// nor failure, and the next allowed call becomes the probe instead.
    /// Without this, a short-circuited probe would leave `probe_in_flight`
    /// set forever and the breaker could never recover.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Current state, for diagnostics.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request().is_ok());
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            cb.allow_request(),
            Err(PlatformError::CircuitOpen)
        ));
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_allows_exactly_one_probe() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Still inside the open window.
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cb.allow_request().is_err());

        // Window elapsed: exactly one request is allowed.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cb.allow_request().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cb.allow_request().is_ok());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn released_probe_returns_to_pool() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(cb.allow_request().is_ok());
        assert!(cb.allow_request().is_err());

        // The granted request never reached the wire; releasing the probe
        // lets the next call try instead.
        cb.release_probe();
        assert!(cb.allow_request().is_ok());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_for_another_window() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cb.allow_request().is_ok());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Refused for another full window.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow_request().is_err());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.allow_request().is_ok());
    }
}
