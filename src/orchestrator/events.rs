//! Orchestrator lifecycle events.

use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::config::StrategyKind;
use crate::state::ConnectionStatus;

/// Broadcast to every subscriber; slow subscribers lose the oldest events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    ProviderRegistered {
        provider_id: String,
    },
    ProviderUnregistered {
        provider_id: String,
    },
    /// A candidate failed and the request moved on.
    ProviderFailed {
        request_id: Uuid,
        provider_id: String,
        error: String,
    },
    RequestCompleted {
        request_id: Uuid,
        provider_id: String,
        latency: Duration,
        attempts: usize,
    },
    RequestFailed {
        request_id: Uuid,
        error: String,
    },
    StatusChanged {
        provider_id: String,
        status: ConnectionStatus,
    },
    StrategyChanged {
        strategy: StrategyKind,
    },
}
