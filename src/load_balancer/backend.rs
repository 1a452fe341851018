//! Provider backend abstraction.
//!
//! # Responsibilities
//! - Represent a single registered completion provider
//! - Track in-flight requests (for Least Connections)
//! - Own the provider's runtime state: status, metrics, recent errors
//! - Derive health from that state

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::config::{CircuitBreakerConfig, ProviderConfig};
use crate::error::OrchestratorError;
use crate::health::{self, HealthStatus};
use crate::observability::metrics;
use crate::providers::{CompletionProvider, TokenUsage};
use crate::resilience::Resilience;
use crate::state::{BackendMetrics, ConnectionStatus, ErrorLog, ErrorRecord};

#[derive(Debug)]
struct BackendState {
    status: ConnectionStatus,
    metrics: BackendMetrics,
    errors: ErrorLog,
}

/// A single registered provider.
pub struct Backend {
    pub id: String,
    pub config: ProviderConfig,
    pub provider: Arc<dyn CompletionProvider>,
    pub resilience: Arc<Resilience>,
    pub registered_at: SystemTime,
    active_requests: AtomicUsize,
    state: Mutex<BackendState>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("active_requests", &self.active_requests())
            .finish_non_exhaustive()
    }
}

impl Backend {
    pub fn new(
        config: ProviderConfig,
        provider: Arc<dyn CompletionProvider>,
        breaker: &CircuitBreakerConfig,
    ) -> Self {
        Self {
            id: config.id.clone(),
            resilience: Arc::new(Resilience::new(&config.id, &config.rate_limit, breaker)),
            config,
            provider,
            registered_at: SystemTime::now(),
            active_requests: AtomicUsize::new(0),
            state: Mutex::new(BackendState {
                status: ConnectionStatus::Connected,
                metrics: BackendMetrics::default(),
                errors: ErrorLog::default(),
            }),
        }
    }

    /// Current number of in-flight requests.
    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Mark a request in flight until the guard drops.
    pub fn track(self: &Arc<Self>) -> InFlightGuard {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            backend: self.clone(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().expect("backend state mutex poisoned").status
    }

    /// Set the status, returning the previous one.
    pub fn set_status(&self, status: ConnectionStatus) -> ConnectionStatus {
        let previous = {
            let mut state = self.state.lock().expect("backend state mutex poisoned");
            std::mem::replace(&mut state.status, status)
        };
        if previous != status {
            tracing::info!(provider = %self.id, from = %previous, to = %status, "Provider status changed");
        }
        previous
    }

    /// Log an error that is not a request outcome (e.g. a failed probe).
    pub fn note_error(&self, error: &OrchestratorError) {
        self.state
            .lock()
            .expect("backend state mutex poisoned")
            .errors
            .push(error.kind(), error.to_string());
    }

    pub fn metrics(&self) -> BackendMetrics {
        self.state.lock().expect("backend state mutex poisoned").metrics.clone()
    }

    pub fn recent_errors(&self, n: usize) -> Vec<ErrorRecord> {
        self.state.lock().expect("backend state mutex poisoned").errors.recent(n)
    }

    pub fn classification(&self) -> HealthStatus {
        health::classify(&self.state.lock().expect("backend state mutex poisoned").metrics)
    }

    /// Eligible for selection: enabled, not in error, not classified unhealthy.
    pub fn is_healthy(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let state = self.state.lock().expect("backend state mutex poisoned");
        state.status != ConnectionStatus::Error && health::classify(&state.metrics) != HealthStatus::Unhealthy
    }

    pub fn health_score(&self) -> f64 {
        health::health_score(&self.state.lock().expect("backend state mutex poisoned").metrics)
    }

    pub fn record_success(&self, latency: Duration, usage: Option<TokenUsage>) {
        let classification = {
            let mut state = self.state.lock().expect("backend state mutex poisoned");
            state.metrics.record_success(latency);
            if let Some(usage) = usage {
                let cost = self.config.cost_of(usage.prompt_tokens, usage.completion_tokens);
                state
                    .metrics
                    .record_usage(usage.prompt_tokens, usage.completion_tokens, cost);
            }
            self.refresh_status(&mut state)
        };
        metrics::record_request(&self.id, true, latency);
        metrics::record_backend_health(&self.id, classification);
    }

    pub fn record_failure(&self, latency: Duration, error: &OrchestratorError) {
        let classification = {
            let mut state = self.state.lock().expect("backend state mutex poisoned");
            state.metrics.record_failure(latency);
            state.errors.push(error.kind(), error.to_string());
            self.refresh_status(&mut state)
        };
        metrics::record_request(&self.id, false, latency);
        metrics::record_backend_health(&self.id, classification);
    }

    /// Keep Connected/Degraded in line with the metrics; Error is only
    /// cleared by a successful probe.
    fn refresh_status(&self, state: &mut BackendState) -> HealthStatus {
        let classification = health::classify(&state.metrics);
        if state.status.is_available() {
            state.status = match classification {
                HealthStatus::Healthy => ConnectionStatus::Connected,
                _ => ConnectionStatus::Degraded,
            };
        }
        classification
    }
}

/// RAII guard over the in-flight request count.
#[derive(Debug)]
pub struct InFlightGuard {
    backend: Arc<Backend>,
}

impl Deref for InFlightGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}
