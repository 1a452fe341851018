//! Per-server runtime state.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

use crate::config::{CircuitBreakerConfig, ToolServerConfig, TransportKind};
use crate::error::OrchestratorError;
use crate::resilience::{CircuitState, Resilience};
use crate::state::{BackendMetrics, ConnectionStatus, ErrorLog, ErrorRecord};
use crate::tool_server::types::{ServerCapabilities, Tool};
use crate::transport::{InitializeResult, Transport};

#[derive(Debug)]
pub(crate) struct ServerState {
    pub status: ConnectionStatus,
    pub connected_at: Option<SystemTime>,
    pub last_activity: Option<SystemTime>,
    pub capabilities: ServerCapabilities,
    pub server_info: Option<InitializeResult>,
    pub metrics: BackendMetrics,
    pub errors: ErrorLog,
    pub reconnect_count: u32,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            connected_at: None,
            last_activity: None,
            capabilities: ServerCapabilities::default(),
            server_info: None,
            metrics: BackendMetrics::default(),
            errors: ErrorLog::default(),
            reconnect_count: 0,
        }
    }
}

/// One registered tool server.
pub(crate) struct ServerEntry {
    pub config: ToolServerConfig,
    pub transport: Arc<dyn Transport>,
    pub resilience: Arc<Resilience>,
    state: Mutex<ServerState>,
    active: AtomicUsize,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect and disconnect.
    pub lifecycle: tokio::sync::Mutex<()>,
}

impl ServerEntry {
    pub fn new(config: ToolServerConfig, transport: Arc<dyn Transport>, breaker: &CircuitBreakerConfig) -> Self {
        let resilience = Arc::new(Resilience::new(config.id.clone(), &config.rate_limit, breaker));
        Self {
            config,
            transport,
            resilience,
            state: Mutex::new(ServerState::default()),
            active: AtomicUsize::new(0),
            reconnect: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Run `f` with the state locked. Never held across an await.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        f(&mut self.state.lock().expect("server state mutex poisoned"))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.with_state(|s| s.status)
    }

    /// Returns the previous status.
    pub fn set_status(&self, status: ConnectionStatus) -> ConnectionStatus {
        self.with_state(|s| std::mem::replace(&mut s.status, status))
    }

    pub fn is_available(&self) -> bool {
        self.status().is_available()
    }

    pub fn find_tool(&self, name: &str) -> Option<Tool> {
        self.with_state(|s| s.capabilities.tools.iter().find(|t| t.name == name).cloned())
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.with_state(|s| s.capabilities.tools.clone())
    }

    pub fn note_error(&self, err: &OrchestratorError) {
        self.with_state(|s| s.errors.push(err.kind(), err.to_string()));
    }

    pub fn record_success(&self, latency: Duration) {
        self.with_state(|s| {
            s.metrics.record_success(latency);
            s.last_activity = Some(SystemTime::now());
        });
    }

    pub fn record_failure(&self, latency: Duration, err: &OrchestratorError) {
        self.with_state(|s| {
            s.metrics.record_failure(latency);
            s.errors.push(err.kind(), err.to_string());
        });
    }

    pub fn touch(&self) {
        self.with_state(|s| s.last_activity = Some(SystemTime::now()));
    }

    pub fn active_executions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn track(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard { entry: Arc::clone(self) }
    }

    /// Handle of the pending reconnect, if any.
    pub fn reconnect_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reconnect.lock().expect("reconnect mutex poisoned")
    }

    pub fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_slot().take() {
            task.abort();
        }
    }

    pub fn snapshot(&self) -> ServerStatus {
        let circuit = self.resilience.circuit_state();
        self.with_state(|s| ServerStatus {
            id: self.config.id.clone(),
            name: self.config.display_name().to_string(),
            transport: self.config.transport,
            enabled: self.config.enabled,
            status: s.status,
            connected_at: s.connected_at,
            last_activity: s.last_activity,
            server_name: s
                .server_info
                .as_ref()
                .and_then(|i| i.server_info.as_ref())
                .and_then(|info| info.name.clone()),
            tools: s.capabilities.tools.len(),
            resources: s.capabilities.resources.len(),
            prompts: s.capabilities.prompts.len(),
            circuit,
            active_executions: self.active_executions(),
            reconnect_count: s.reconnect_count,
            metrics: s.metrics.clone(),
            recent_errors: s.errors.recent(10),
        })
    }
}

/// Decrements the in-flight count on drop.
pub(crate) struct ActiveGuard {
    entry: Arc<ServerEntry>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.entry.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a tool server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub name: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub status: ConnectionStatus,
    pub connected_at: Option<SystemTime>,
    pub last_activity: Option<SystemTime>,
    pub server_name: Option<String>,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    pub circuit: CircuitState,
    pub active_executions: usize,
    pub reconnect_count: u32,
    pub metrics: BackendMetrics,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Totals across every registered server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateMetrics {
    pub servers: usize,
    pub connected: usize,
    pub tools: usize,
    pub active_executions: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Request-weighted mean of per-server averages.
    pub average_latency_ms: f64,
}
