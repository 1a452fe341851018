//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: testing if backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= threshold within monitoring window
//! Open → Half-Open: first call attempted after the reset timeout
//! Half-Open → Closed: probe request succeeds
//! Half-Open → Open: probe request fails
//! ```
//!
//! # Design Decisions
//! - Per-backend circuit breaker (not global)
//! - Fail fast in Open state (no waiting for timeout)
//! - Single probe in Half-Open (prevents hammering recovering backend)

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::config::CircuitBreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge value exported to metrics.
    pub fn as_gauge(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Per-backend breaker state machine. Time is passed in by the caller.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    monitoring_window: Duration,
    reset_timeout: Duration,
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            monitoring_window: config.monitoring_window(),
            reset_timeout: config.reset_timeout(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            first_failure_at: None,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Ask permission to dispatch a call at `now`.
    ///
    /// Returns false when the call must fail fast. An open breaker whose reset
    /// timeout elapsed moves to half-open and admits exactly one probe.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed > self.reset_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.first_failure_at = None;
        self.probe_in_flight = false;
        self.state = CircuitState::Closed;
    }

    pub fn on_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.trip(now);
            }
            CircuitState::Open => {
                self.last_failure_at = Some(now);
            }
            CircuitState::Closed => {
                let window_expired = self
                    .first_failure_at
                    .map(|first| now.saturating_duration_since(first) > self.monitoring_window)
                    .unwrap_or(true);
                if window_expired {
                    self.consecutive_failures = 0;
                    self.first_failure_at = Some(now);
                }
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.trip(now);
                }
            }
        }
    }

    /// Give back an unused half-open probe slot without judging the backend.
    pub fn release_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: threshold,
            monitoring_window_ms: 60_000,
            reset_timeout_ms: reset_ms,
        })
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let mut cb = breaker(5, 1000);
        let now = Instant::now();
        for _ in 0..4 {
            assert!(cb.try_acquire(now));
            cb.on_failure(now);
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.on_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire(now));
    }

    #[test]
    fn test_success_resets_counter() {
        let mut cb = breaker(3, 1000);
        let now = Instant::now();
        cb.on_failure(now);
        cb.on_failure(now);
        cb.on_success();
        cb.on_failure(now);
        cb.on_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failures_outside_window_restart_count() {
        let mut cb = CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: 2,
            monitoring_window_ms: 1000,
            reset_timeout_ms: 1000,
        });
        let start = Instant::now();
        cb.on_failure(start);
        cb.on_failure(start + Duration::from_secs(5));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 1);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let mut cb = breaker(1, 100);
        let start = Instant::now();
        cb.on_failure(start);
        assert!(!cb.try_acquire(start + Duration::from_millis(50)));

        let later = start + Duration::from_millis(150);
        assert!(cb.try_acquire(later));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.try_acquire(later));

        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire(later));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let mut cb = breaker(1, 100);
        let start = Instant::now();
        cb.on_failure(start);
        let later = start + Duration::from_millis(150);
        assert!(cb.try_acquire(later));
        cb.on_failure(later);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire(later + Duration::from_millis(50)));
    }

    #[test]
    fn test_released_probe_can_be_reacquired() {
        let mut cb = breaker(1, 0);
        let start = Instant::now();
        cb.on_failure(start);
        let later = start + Duration::from_millis(1);
        assert!(cb.try_acquire(later));
        cb.release_probe();
        assert!(cb.try_acquire(later));
    }
}
