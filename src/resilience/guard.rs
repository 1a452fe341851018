//! Combined per-backend guard: rate limiter + circuit breaker.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::{CircuitBreakerConfig, RateLimitConfig};
use crate::error::{OrchestratorError, Result};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::resilience::rate_limit::SlidingWindowLimiter;

/// Resilience state for one backend.
///
/// Reflects only calls attempted through this backend.
#[derive(Debug)]
pub struct Resilience {
    backend: String,
    limiter: Mutex<SlidingWindowLimiter>,
    breaker: Mutex<CircuitBreaker>,
}

impl Resilience {
    pub fn new(
        backend: impl Into<String>,
        rate_limit: &RateLimitConfig,
        circuit_breaker: &CircuitBreakerConfig,
    ) -> Self {
        Self {
            backend: backend.into(),
            limiter: Mutex::new(SlidingWindowLimiter::new(rate_limit)),
            breaker: Mutex::new(CircuitBreaker::new(circuit_breaker)),
        }
    }

    /// Check rate limit and circuit state before dispatching a call.
    ///
    /// The returned permit must be resolved with [`CallPermit::record`];
    /// dropping it unresolved releases a half-open probe slot.
    pub fn before_call(self: &Arc<Self>) -> Result<CallPermit> {
        let now = Instant::now();

        // Held until the attempt is recorded so concurrent callers see each other.
        let mut limiter = self.limiter.lock().expect("rate limiter mutex poisoned");
        if let Err(retry_after) = limiter.check(now) {
            drop(limiter);
            tracing::debug!(backend = %self.backend, retry_after = ?retry_after, "Rate limit exceeded");
            metrics::record_rate_limited(&self.backend);
            return Err(OrchestratorError::RateLimited {
                backend: self.backend.clone(),
                retry_after,
            });
        }

        let mut breaker = self.breaker.lock().expect("circuit breaker mutex poisoned");
        let before = breaker.state();
        if !breaker.try_acquire(now) {
            return Err(OrchestratorError::CircuitOpen {
                backend: self.backend.clone(),
            });
        }
        let after = breaker.state();
        drop(breaker);
        limiter.record(now);
        drop(limiter);
        if before != after {
            self.on_transition(before, after);
        }

        Ok(CallPermit {
            guard: Arc::clone(self),
            resolved: false,
        })
    }

    /// Record the outcome of a dispatched call.
    pub fn record(&self, success: bool, latency: Duration) {
        let now = Instant::now();
        let mut breaker = self.breaker.lock().expect("circuit breaker mutex poisoned");
        let before = breaker.state();
        if success {
            breaker.on_success();
        } else {
            breaker.on_failure(now);
        }
        let after = breaker.state();
        drop(breaker);

        tracing::trace!(backend = %self.backend, success, latency = ?latency, "Call recorded");
        if before != after {
            self.on_transition(before, after);
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().expect("circuit breaker mutex poisoned").state()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.breaker
            .lock()
            .expect("circuit breaker mutex poisoned")
            .consecutive_failures()
    }

    fn release(&self) {
        self.breaker
            .lock()
            .expect("circuit breaker mutex poisoned")
            .release_probe();
    }

    fn on_transition(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => {
                tracing::warn!(backend = %self.backend, from = ?from, "Circuit opened")
            }
            CircuitState::HalfOpen => {
                tracing::info!(backend = %self.backend, "Circuit half-open, allowing probe")
            }
            CircuitState::Closed => tracing::info!(backend = %self.backend, "Circuit closed"),
        }
        metrics::record_circuit_state(&self.backend, to);
    }
}

/// Permission to make one call through a [`Resilience`] guard.
#[derive(Debug)]
pub struct CallPermit {
    guard: Arc<Resilience>,
    resolved: bool,
}

impl CallPermit {
    /// Record the call outcome and consume the permit.
    pub fn record(mut self, success: bool, latency: Duration) {
        self.resolved = true;
        self.guard.record(success, latency);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.guard.release();
        }
    }
}
