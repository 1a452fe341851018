//! Provider health reporting and active probing.

use async_trait::async_trait;
use serde::Serialize;

use crate::health::{self as classification, HealthProbe, HealthStatus};
use crate::observability::metrics;
use crate::orchestrator::{Orchestrator, OrchestratorEvent};
use crate::resilience::{with_timeout, CircuitState};
use crate::state::{BackendMetrics, ConnectionStatus, ErrorRecord};

/// Errors included in a health snapshot.
const RECENT_ERRORS: usize = 10;

/// Point-in-time view of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub id: String,
    pub enabled: bool,
    pub status: ConnectionStatus,
    pub health: HealthStatus,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub active_requests: usize,
    pub metrics: BackendMetrics,
    pub recent_errors: Vec<ErrorRecord>,
}

impl Orchestrator {
    /// Snapshot of every provider in registration order.
    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.inner
            .pool
            .all()
            .iter()
            .map(|b| {
                let metrics = b.metrics();
                ProviderHealth {
                    id: b.id.clone(),
                    enabled: b.config.enabled,
                    status: b.status(),
                    health: classification::classify(&metrics),
                    circuit: b.resilience.circuit_state(),
                    consecutive_failures: b.resilience.consecutive_failures(),
                    active_requests: b.active_requests(),
                    metrics,
                    recent_errors: b.recent_errors(RECENT_ERRORS),
                }
            })
            .collect()
    }

    /// Pool-level health: unhealthy when no provider is usable.
    pub fn overall_health(&self) -> HealthStatus {
        classification::aggregate(
            self.inner
                .pool
                .all()
                .iter()
                .filter(|b| b.config.enabled)
                .map(|b| if b.is_healthy() { b.classification() } else { HealthStatus::Unhealthy }),
        )
    }

    /// Probe every enabled provider once.
    pub async fn check_health(&self) {
        let timeout = self.inner.health_check.timeout();
        for backend in self.inner.pool.all().iter().filter(|b| b.config.enabled) {
            let outcome = with_timeout(&backend.id, timeout, backend.provider.health_check()).await;
            let status = match &outcome {
                Ok(()) => ConnectionStatus::Connected,
                Err(e) => {
                    tracing::warn!(provider = %backend.id, error = %e, "Provider health check failed");
                    backend.note_error(e);
                    ConnectionStatus::Error
                }
            };
            let previous = backend.set_status(status);
            metrics::record_backend_health(
                &backend.id,
                if outcome.is_ok() { backend.classification() } else { HealthStatus::Unhealthy },
            );
            if previous != status {
                let _ = self.inner.events.send(OrchestratorEvent::StatusChanged {
                    provider_id: backend.id.clone(),
                    status,
                });
            }
        }
    }
}

#[async_trait]
impl HealthProbe for Orchestrator {
    fn name(&self) -> &'static str {
        "providers"
    }

    async fn probe_all(&self) {
        self.check_health().await;
    }
}
