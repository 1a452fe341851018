//! Registry and lifecycle driver for tool servers.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::validation::validate_tool_server;
use crate::config::{CacheConfig, CircuitBreakerConfig, HealthCheckConfig, OrchestratorConfig, ToolServerConfig};
use crate::error::{OrchestratorError, Result};
use crate::health::{classify, HealthMonitor, HealthProbe, HealthStatus};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resilience::backoff::reconnect_delay;
use crate::resilience::with_timeout;
use crate::state::ConnectionStatus;
use crate::tool_server::cache::ResourceCache;
use crate::tool_server::discovery::discover;
use crate::tool_server::events::ManagerEvent;
use crate::tool_server::state::{AggregateMetrics, ServerEntry, ServerStatus};
use crate::tool_server::types::{
    ExecutionContext, ExecutionOptions, ExecutionResult, ExecutionStatus, Progress, ServerTool, ToolCallResult,
};
use crate::transport::{create_transport, negotiate, EventSink, Notification, Transport, TransportEvent, TransportEventKind};

const EVENT_CAPACITY: usize = 256;

struct ActiveExecution {
    context: Mutex<ExecutionContext>,
    cancel: Notify,
}

struct ManagerInner {
    servers: DashMap<String, Arc<ServerEntry>>,
    executions: DashMap<Uuid, Arc<ActiveExecution>>,
    cache: ResourceCache,
    breaker: CircuitBreakerConfig,
    health_check: HealthCheckConfig,
    events: broadcast::Sender<ManagerEvent>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    shutdown: Shutdown,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for slot in [&self.dispatcher, &self.monitor] {
            if let Some(task) = slot.lock().expect("task mutex poisoned").take() {
                task.abort();
            }
        }
    }
}

/// Connects to tool servers, tracks their capabilities and executes tools.
///
/// Cheap to clone; clones share the same registry. Must be created inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct ToolServerManager {
    inner: Arc<ManagerInner>,
}

impl ToolServerManager {
    pub fn new(breaker: CircuitBreakerConfig, health_check: HealthCheckConfig, cache: &CacheConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            servers: DashMap::new(),
            executions: DashMap::new(),
            cache: ResourceCache::new(cache.max_entries),
            breaker,
            health_check,
            events,
            transport_tx,
            shutdown: Shutdown::new(),
            dispatcher: Mutex::new(None),
            monitor: Mutex::new(None),
        });

        let dispatcher = tokio::spawn(dispatch_transport_events(Arc::downgrade(&inner), transport_rx));
        *inner.dispatcher.lock().expect("task mutex poisoned") = Some(dispatcher);
        Self { inner }
    }

    /// Build a manager and add every configured server.
    ///
    /// Servers that fail to connect stay registered and follow the reconnect path.
    pub async fn from_config(config: &OrchestratorConfig) -> Self {
        let manager = Self::new(
            config.circuit_breaker.clone(),
            config.health_check.clone(),
            &config.cache,
        );
        for server in &config.tool_servers {
            if let Err(e) = manager.add_server(server.clone()).await {
                tracing::warn!(server = %server.id, error = %e, "Tool server unavailable at startup");
            }
        }
        manager
    }

    /// Validate, register and (when enabled) connect a server.
    ///
    /// A failed connection leaves the server registered in `error` and
    /// returns the connection error.
    pub async fn add_server(&self, config: ToolServerConfig) -> Result<()> {
        validate_tool_server(&config).map_err(OrchestratorError::Config)?;
        let transport = create_transport(&config, self.event_sink(&config.id))?;
        self.add_server_with_transport(config, transport).await
    }

    /// Register a server over a caller-supplied transport.
    ///
    /// Transports built outside the manager should report through [`Self::event_sink`].
    pub async fn add_server_with_transport(&self, config: ToolServerConfig, transport: Arc<dyn Transport>) -> Result<()> {
        validate_tool_server(&config).map_err(OrchestratorError::Config)?;
        let id = config.id.clone();
        if self.inner.servers.contains_key(&id) {
            self.remove_server(&id).await?;
        }

        let entry = Arc::new(ServerEntry::new(config, transport, &self.inner.breaker));
        self.inner.servers.insert(id.clone(), entry.clone());
        tracing::info!(server = %id, transport = %entry.config.transport, "Tool server registered");
        self.emit(ManagerEvent::ServerAdded { server_id: id });

        if entry.config.enabled {
            self.connect_entry(&entry).await?;
        }
        Ok(())
    }

    /// Sink that routes transport events for `server_id` into this manager.
    pub fn event_sink(&self, server_id: &str) -> EventSink {
        EventSink::new(server_id, self.inner.transport_tx.clone())
    }

    pub async fn remove_server(&self, server_id: &str) -> Result<()> {
        let (_, entry) = self
            .inner
            .servers
            .remove(server_id)
            .ok_or_else(|| OrchestratorError::NotFound { backend: server_id.to_string() })?;
        entry.cancel_reconnect();

        let _lifecycle = entry.lifecycle.lock().await;
        if let Err(e) = entry.transport.disconnect().await {
            tracing::debug!(server = %server_id, error = %e, "Disconnect during removal failed");
        }
        entry.set_status(ConnectionStatus::Disconnected);
        self.inner.cache.invalidate_server(server_id);

        tracing::info!(server = %server_id, "Tool server removed");
        self.emit(ManagerEvent::ServerRemoved {
            server_id: server_id.to_string(),
        });
        Ok(())
    }

    /// Connect now, cancelling any scheduled reconnect and resetting its count.
    pub async fn connect_server(&self, server_id: &str) -> Result<()> {
        let entry = self.entry(server_id)?;
        entry.cancel_reconnect();
        entry.with_state(|s| s.reconnect_count = 0);
        self.connect_entry(&entry).await
    }

    pub async fn disconnect_server(&self, server_id: &str) -> Result<()> {
        let entry = self.entry(server_id)?;
        entry.cancel_reconnect();

        let _lifecycle = entry.lifecycle.lock().await;
        let result = entry.transport.disconnect().await;
        entry.with_state(|s| s.connected_at = None);
        self.update_status(&entry, ConnectionStatus::Disconnected);

        tracing::info!(server = %server_id, "Tool server disconnected");
        self.emit(ManagerEvent::ServerDisconnected {
            server_id: server_id.to_string(),
        });
        result
    }

    /// Call one tool on one server.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool: &str,
        params: Value,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let entry = self.available_entry(server_id)?;
        let definition = entry.find_tool(tool).ok_or_else(|| OrchestratorError::ToolNotFound {
            server: server_id.to_string(),
            tool: tool.to_string(),
        })?;
        let missing = definition.missing_params(&params);
        if !missing.is_empty() {
            return Err(OrchestratorError::Validation {
                tool: tool.to_string(),
                missing,
            });
        }
        let permit = entry.resilience.before_call()?;
        let _active = entry.track();

        let request_id = Uuid::new_v4();
        let execution = Arc::new(ActiveExecution {
            context: Mutex::new(ExecutionContext {
                request_id,
                server_id: server_id.to_string(),
                tool: tool.to_string(),
                params: params.clone(),
                progress: None,
                status: ExecutionStatus::Running,
                cancellable: options.cancellable,
                started_at: SystemTime::now(),
            }),
            cancel: Notify::new(),
        });
        self.inner.executions.insert(request_id, execution.clone());
        tracing::debug!(server = %server_id, tool, request_id = %request_id, "Tool execution started");
        self.emit(ManagerEvent::ExecutionStarted {
            request_id,
            server_id: server_id.to_string(),
            tool: tool.to_string(),
        });

        let timeout = options.timeout.unwrap_or_else(|| entry.config.timeout());
        let call = json!({
            "name": tool,
            "arguments": params,
            "_meta": { "progressToken": request_id.to_string() },
        });
        let started = Instant::now();
        let outcome = tokio::select! {
            result = with_timeout(server_id, timeout, entry.transport.request("tools/call", Some(call), timeout)) => {
                result.and_then(|value| parse_call_result(server_id, value))
            }
            _ = execution.cancel.notified() => Err(OrchestratorError::Cancelled {
                request_id: request_id.to_string(),
            }),
        };
        let duration = started.elapsed();
        let status = match &outcome {
            Ok(_) => ExecutionStatus::Completed,
            Err(OrchestratorError::Cancelled { .. }) => ExecutionStatus::Cancelled,
            Err(OrchestratorError::Timeout { .. }) => ExecutionStatus::TimedOut,
            Err(_) => ExecutionStatus::Failed,
        };
        execution.context.lock().expect("execution mutex poisoned").status = status;
        self.inner.executions.remove(&request_id);

        match outcome {
            Ok(result) => {
                permit.record(true, duration);
                entry.record_success(duration);
                let is_error = result.is_error;
                metrics::record_tool_execution(server_id, tool, if is_error { "tool_error" } else { "success" });
                tracing::debug!(server = %server_id, tool, request_id = %request_id, duration = ?duration, is_error, "Tool execution finished");
                self.emit(ManagerEvent::ExecutionCompleted {
                    request_id,
                    duration,
                    is_error,
                });
                Ok(ExecutionResult {
                    request_id,
                    server_id: server_id.to_string(),
                    tool: tool.to_string(),
                    result,
                    duration,
                })
            }
            Err(e @ OrchestratorError::Cancelled { .. }) => {
                // Cancellation says nothing about the server's health.
                drop(permit);
                metrics::record_tool_execution(server_id, tool, "cancelled");
                tracing::info!(server = %server_id, tool, request_id = %request_id, "Tool execution cancelled");
                self.emit(ManagerEvent::ExecutionCancelled { request_id });
                Err(e)
            }
            Err(e) => {
                permit.record(false, duration);
                entry.record_failure(duration, &e);
                let outcome = if status == ExecutionStatus::TimedOut { "timeout" } else { "error" };
                metrics::record_tool_execution(server_id, tool, outcome);
                tracing::warn!(server = %server_id, tool, request_id = %request_id, error = %e, "Tool execution failed");
                self.emit(ManagerEvent::ExecutionFailed {
                    request_id,
                    status,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Call `tool` on any connected server exposing it, least busy first.
    pub async fn call_tool(&self, tool: &str, params: Value, options: ExecutionOptions) -> Result<ExecutionResult> {
        let mut candidates: Vec<Arc<ServerEntry>> = self
            .inner
            .servers
            .iter()
            .filter(|entry| entry.is_available() && entry.find_tool(tool).is_some())
            .map(|entry| entry.value().clone())
            .collect();
        if candidates.is_empty() {
            return Err(OrchestratorError::ToolNotFound {
                server: "*".to_string(),
                tool: tool.to_string(),
            });
        }
        candidates.sort_by(|a, b| {
            a.active_executions()
                .cmp(&b.active_executions())
                .then_with(|| a.id().cmp(b.id()))
        });

        let mut last_error = OrchestratorError::NoBackends;
        for entry in candidates {
            match self.execute_tool(entry.id(), tool, params.clone(), options.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_caller_error() => return Err(e),
                Err(e) => {
                    tracing::warn!(server = %entry.id(), tool, error = %e, "Tool call failed, trying next server");
                    last_error = e;
                }
            }
        }
        Err(OrchestratorError::AllBackendsFailed {
            last_error: Box::new(last_error),
        })
    }

    /// Cancel a running execution. Returns false when it is unknown, already
    /// finished, or not cancellable.
    pub async fn cancel_execution(&self, request_id: Uuid) -> bool {
        let Some(execution) = self.inner.executions.get(&request_id).map(|e| e.value().clone()) else {
            return false;
        };
        let server_id = {
            let mut ctx = execution.context.lock().expect("execution mutex poisoned");
            if !ctx.cancellable {
                tracing::debug!(request_id = %request_id, "Execution is not cancellable");
                return false;
            }
            ctx.status = ExecutionStatus::Cancelled;
            ctx.server_id.clone()
        };
        execution.cancel.notify_one();

        if let Ok(entry) = self.entry(&server_id) {
            let params = json!({ "requestId": request_id.to_string(), "reason": "cancelled by client" });
            if let Err(e) = entry.transport.notify("notifications/cancelled", Some(params)).await {
                tracing::debug!(server = %server_id, error = %e, "Could not deliver cancellation");
            }
        }
        true
    }

    /// Executions currently in flight.
    pub fn active_executions(&self) -> Vec<ExecutionContext> {
        self.inner
            .executions
            .iter()
            .map(|e| e.context.lock().expect("execution mutex poisoned").clone())
            .collect()
    }

    /// Tools of every connected server, ordered by server id.
    pub fn get_all_tools(&self) -> Vec<ServerTool> {
        let mut entries = self.available_entries();
        entries.sort_by(|a, b| a.id().cmp(b.id()));
        entries.iter().flat_map(|entry| server_tools(entry)).collect()
    }

    /// Tools of one server, or of all connected servers.
    pub fn list_tools(&self, server_id: Option<&str>) -> Result<Vec<ServerTool>> {
        match server_id {
            Some(id) => {
                let entry = self.entry(id)?;
                if entry.is_available() {
                    Ok(server_tools(&entry))
                } else {
                    Ok(Vec::new())
                }
            }
            None => Ok(self.get_all_tools()),
        }
    }

    pub fn get_server_status(&self, server_id: Option<&str>) -> Result<Vec<ServerStatus>> {
        match server_id {
            Some(id) => Ok(vec![self.entry(id)?.snapshot()]),
            None => {
                let mut all: Vec<ServerStatus> = self.inner.servers.iter().map(|e| e.snapshot()).collect();
                all.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(all)
            }
        }
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.servers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// `resources/read`, served from the cache when possible.
    pub async fn read_resource(&self, server_id: &str, uri: &str) -> Result<Value> {
        let entry = self.available_entry(server_id)?;
        if let Some(hit) = self.inner.cache.get(server_id, uri) {
            tracing::trace!(server = %server_id, uri, "Resource cache hit");
            return Ok(hit);
        }
        let contents = self
            .guarded_request(&entry, "resources/read", json!({ "uri": uri }))
            .await?;
        self.inner.cache.insert(server_id, uri, contents.clone());
        Ok(contents)
    }

    pub async fn get_prompt(&self, server_id: &str, name: &str, arguments: Value) -> Result<Value> {
        let entry = self.available_entry(server_id)?;
        self.guarded_request(&entry, "prompts/get", json!({ "name": name, "arguments": arguments }))
            .await
    }

    /// Round-trip a `ping` and return its latency.
    pub async fn ping(&self, server_id: &str) -> Result<Duration> {
        let entry = self.available_entry(server_id)?;
        let started = Instant::now();
        entry
            .transport
            .request("ping", None, self.inner.health_check.timeout())
            .await?;
        entry.touch();
        Ok(started.elapsed())
    }

    pub fn aggregate_metrics(&self) -> AggregateMetrics {
        let mut totals = AggregateMetrics::default();
        let mut weighted_latency = 0.0;
        for entry in self.inner.servers.iter() {
            let (status, metrics, tools) = entry.with_state(|s| (s.status, s.metrics.clone(), s.capabilities.tools.len()));
            totals.servers += 1;
            if status.is_available() {
                totals.connected += 1;
                totals.tools += tools;
            }
            totals.total_requests += metrics.total_requests;
            totals.successful_requests += metrics.successful_requests;
            totals.failed_requests += metrics.failed_requests;
            weighted_latency += metrics.average_latency_ms * metrics.total_requests as f64;
        }
        totals.active_executions = self.inner.executions.len();
        if totals.total_requests > 0 {
            totals.average_latency_ms = weighted_latency / totals.total_requests as f64;
        }
        totals
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Start pinging connected servers. No-op when disabled or already running.
    pub fn start_health_checks(&self) {
        if !self.inner.health_check.enabled {
            return;
        }
        let mut monitor = self.inner.monitor.lock().expect("task mutex poisoned");
        if monitor.is_some() {
            return;
        }
        let task = HealthMonitor::new(self.clone(), self.inner.health_check.interval());
        *monitor = Some(tokio::spawn(task.run(self.inner.shutdown.subscribe())));
    }

    /// Stop timers and reconnects, cancel executions and disconnect every server.
    pub async fn shutdown(&self) {
        self.inner.shutdown.trigger();
        if let Some(task) = self.inner.monitor.lock().expect("task mutex poisoned").take() {
            task.abort();
        }

        for execution in self.inner.executions.iter() {
            execution.cancel.notify_one();
        }

        let entries: Vec<Arc<ServerEntry>> = self.inner.servers.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            entry.cancel_reconnect();
            let _lifecycle = entry.lifecycle.lock().await;
            if let Err(e) = entry.transport.disconnect().await {
                tracing::debug!(server = %entry.id(), error = %e, "Disconnect during shutdown failed");
            }
            self.update_status(&entry, ConnectionStatus::Disconnected);
        }

        if let Some(task) = self.inner.dispatcher.lock().expect("task mutex poisoned").take() {
            task.abort();
        }
        self.inner.cache.clear();
        tracing::info!("Tool server manager shut down");
    }

    async fn connect_entry(&self, entry: &Arc<ServerEntry>) -> Result<()> {
        let lifecycle = entry.lifecycle.lock().await;
        if entry.transport.is_connected() && entry.is_available() {
            return Ok(());
        }
        self.update_status(entry, ConnectionStatus::Connecting);

        let id = entry.id();
        let timeout = entry.config.timeout();
        let established = async {
            with_timeout(id, timeout, entry.transport.connect()).await?;
            let info = negotiate(&*entry.transport, id, timeout).await?;
            let capabilities = discover(&*entry.transport, &entry.config).await;
            Ok::<_, OrchestratorError>((info, capabilities))
        }
        .await;

        match established {
            Ok((info, capabilities)) => {
                let (tools, resources, prompts) = (
                    capabilities.tools.len(),
                    capabilities.resources.len(),
                    capabilities.prompts.len(),
                );
                let now = SystemTime::now();
                entry.with_state(|s| {
                    s.connected_at = Some(now);
                    s.last_activity = Some(now);
                    s.capabilities = capabilities;
                    s.server_info = Some(info);
                    s.reconnect_count = 0;
                });
                self.update_status(entry, ConnectionStatus::Connected);
                metrics::record_backend_health(id, HealthStatus::Healthy);

                tracing::info!(server = %id, tools, resources, prompts, "Tool server connected");
                self.emit(ManagerEvent::ServerConnected {
                    server_id: id.to_string(),
                    tools,
                    resources,
                    prompts,
                });
                Ok(())
            }
            Err(e) => {
                if let Err(close) = entry.transport.disconnect().await {
                    tracing::debug!(server = %id, error = %close, "Cleanup after failed connect failed");
                }
                drop(lifecycle);
                entry.note_error(&e);
                self.update_status(entry, ConnectionStatus::Error);
                metrics::record_backend_health(id, HealthStatus::Unhealthy);

                tracing::warn!(server = %id, error = %e, "Tool server connection failed");
                self.emit(ManagerEvent::ServerError {
                    server_id: id.to_string(),
                    error: e.to_string(),
                });
                self.schedule_reconnect(entry);
                Err(e)
            }
        }
    }

    /// Mark a live server as failed and start the reconnect path.
    async fn connection_lost(&self, entry: &Arc<ServerEntry>, error: OrchestratorError) {
        if self.inner.shutdown.is_triggered() {
            return;
        }
        {
            let _lifecycle = entry.lifecycle.lock().await;
            // Already handled, deliberately disconnected, or mid-connect.
            if !entry.is_available() {
                return;
            }
            entry.note_error(&error);
            self.update_status(entry, ConnectionStatus::Error);
            metrics::record_backend_health(entry.id(), HealthStatus::Unhealthy);

            tracing::warn!(server = %entry.id(), error = %error, "Tool server connection lost");
            self.emit(ManagerEvent::ServerError {
                server_id: entry.id().to_string(),
                error: error.to_string(),
            });
            if let Err(e) = entry.transport.disconnect().await {
                tracing::debug!(server = %entry.id(), error = %e, "Disconnect after failure failed");
            }
        }
        self.schedule_reconnect(entry);
    }

    fn schedule_reconnect(&self, entry: &Arc<ServerEntry>) {
        if !entry.config.auto_reconnect || self.inner.shutdown.is_triggered() {
            return;
        }

        let mut slot = entry.reconnect_slot();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let limit = entry.config.retry_attempts;
        let attempt = entry.with_state(|s| {
            if s.reconnect_count >= limit {
                None
            } else {
                s.reconnect_count += 1;
                Some(s.reconnect_count)
            }
        });
        let Some(attempt) = attempt else {
            tracing::error!(server = %entry.id(), attempts = limit, "Reconnect attempts exhausted");
            self.emit(ManagerEvent::ServerError {
                server_id: entry.id().to_string(),
                error: format!("gave up after {limit} reconnect attempts"),
            });
            return;
        };
        let delay = reconnect_delay(attempt - 1, entry.config.retry_delay());

        self.update_status(entry, ConnectionStatus::Reconnecting);
        tracing::info!(server = %entry.id(), attempt, delay = ?delay, "Reconnect scheduled");
        self.emit(ManagerEvent::ReconnectScheduled {
            server_id: entry.id().to_string(),
            attempt,
            delay,
        });

        let inner = Arc::downgrade(&self.inner);
        let target = Arc::downgrade(entry);
        let mut shutdown = self.inner.shutdown.subscribe();
        *slot = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => return,
            }
            let (Some(inner), Some(entry)) = (inner.upgrade(), target.upgrade()) else {
                return;
            };
            entry.reconnect_slot().take();
            // Removed or replaced while waiting.
            let current = inner
                .servers
                .get(entry.id())
                .is_some_and(|registered| Arc::ptr_eq(registered.value(), &entry));
            if !current {
                return;
            }
            let manager = ToolServerManager { inner };
            if let Err(e) = manager.connect_entry(&entry).await {
                tracing::debug!(server = %entry.id(), attempt, error = %e, "Reconnect attempt failed");
            }
        }));
    }

    fn on_transport_event(&self, event: TransportEvent) {
        let Some(entry) = self.inner.servers.get(&event.server_id).map(|e| e.value().clone()) else {
            tracing::debug!(server = %event.server_id, "Event for unknown server dropped");
            return;
        };
        match event.kind {
            TransportEventKind::Closed { reason } => {
                if entry.transport.is_connected() {
                    tracing::debug!(server = %entry.id(), "Ignoring close from a previous session");
                    return;
                }
                let manager = self.clone();
                tokio::spawn(async move {
                    let error = OrchestratorError::ConnectionClosed {
                        backend: entry.id().to_string(),
                        reason,
                    };
                    manager.connection_lost(&entry, error).await;
                });
            }
            TransportEventKind::Notification(notification) => self.on_notification(entry, notification),
        }
    }

    fn on_notification(&self, entry: Arc<ServerEntry>, notification: Notification) {
        entry.touch();
        match notification.method.as_str() {
            "notifications/progress" => self.on_progress(notification.params.as_ref()),
            "notifications/tools/list_changed"
            | "notifications/resources/list_changed"
            | "notifications/prompts/list_changed" => {
                if notification.method == "notifications/resources/list_changed" {
                    self.inner.cache.invalidate_server(entry.id());
                }
                let manager = self.clone();
                tokio::spawn(async move { manager.rediscover(&entry).await });
            }
            _ => {
                tracing::trace!(server = %entry.id(), method = %notification.method, "Server notification");
                self.emit(ManagerEvent::Notification {
                    server_id: entry.id().to_string(),
                    method: notification.method,
                    params: notification.params,
                });
            }
        }
    }

    fn on_progress(&self, params: Option<&Value>) {
        let Some(params) = params else {
            return;
        };
        let Some(request_id) = params
            .get("progressToken")
            .and_then(Value::as_str)
            .and_then(|token| Uuid::parse_str(token).ok())
        else {
            tracing::debug!("Progress notification without a known token");
            return;
        };
        let Some(execution) = self.inner.executions.get(&request_id).map(|e| e.value().clone()) else {
            return;
        };

        let progress = Progress {
            current: params.get("progress").and_then(Value::as_f64).unwrap_or_default(),
            total: params.get("total").and_then(Value::as_f64),
            message: params.get("message").and_then(Value::as_str).map(str::to_string),
        };
        execution.context.lock().expect("execution mutex poisoned").progress = Some(progress.clone());
        self.emit(ManagerEvent::ExecutionProgress { request_id, progress });
    }

    async fn rediscover(&self, entry: &Arc<ServerEntry>) {
        if !entry.is_available() {
            return;
        }
        let capabilities = discover(&*entry.transport, &entry.config).await;
        let tools = capabilities.tools.len();
        entry.with_state(|s| s.capabilities = capabilities);

        tracing::info!(server = %entry.id(), tools, "Tool server capabilities refreshed");
        self.emit(ManagerEvent::ToolsChanged {
            server_id: entry.id().to_string(),
            tools,
        });
    }

    async fn guarded_request(&self, entry: &Arc<ServerEntry>, method: &str, params: Value) -> Result<Value> {
        let permit = entry.resilience.before_call()?;
        let started = Instant::now();
        let outcome = entry.transport.request(method, Some(params), entry.config.timeout()).await;
        let latency = started.elapsed();
        match &outcome {
            Ok(_) => {
                permit.record(true, latency);
                entry.record_success(latency);
            }
            Err(e) => {
                permit.record(false, latency);
                entry.record_failure(latency, e);
            }
        }
        outcome
    }

    fn entry(&self, server_id: &str) -> Result<Arc<ServerEntry>> {
        self.inner
            .servers
            .get(server_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| OrchestratorError::NotFound {
                backend: server_id.to_string(),
            })
    }

    fn available_entry(&self, server_id: &str) -> Result<Arc<ServerEntry>> {
        let entry = self.entry(server_id)?;
        let status = entry.status();
        if !status.is_available() {
            return Err(OrchestratorError::Connection {
                backend: server_id.to_string(),
                reason: format!("server is {status}"),
            });
        }
        Ok(entry)
    }

    fn available_entries(&self) -> Vec<Arc<ServerEntry>> {
        self.inner
            .servers
            .iter()
            .filter(|e| e.is_available())
            .map(|e| e.value().clone())
            .collect()
    }

    fn update_status(&self, entry: &ServerEntry, status: ConnectionStatus) {
        let previous = entry.set_status(status);
        if previous != status {
            tracing::debug!(server = %entry.id(), from = %previous, to = %status, "Tool server status changed");
            self.emit(ManagerEvent::StatusChanged {
                server_id: entry.id().to_string(),
                status,
            });
        }
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.inner.events.send(event);
    }
}

#[async_trait]
impl HealthProbe for ToolServerManager {
    fn name(&self) -> &'static str {
        "tool_servers"
    }

    async fn probe_all(&self) {
        let timeout = self.inner.health_check.timeout();
        let probes = self.available_entries().into_iter().map(|entry| async move {
            match entry.transport.request("ping", None, timeout).await {
                Ok(_) => {
                    entry.touch();
                    let status = entry.with_state(|s| classify(&s.metrics));
                    metrics::record_backend_health(entry.id(), status);
                    tracing::trace!(server = %entry.id(), "Ping ok");
                }
                Err(e) => {
                    tracing::warn!(server = %entry.id(), error = %e, "Ping failed");
                    self.connection_lost(&entry, e).await;
                }
            }
        });
        futures_util::future::join_all(probes).await;
    }
}

async fn dispatch_transport_events(inner: Weak<ManagerInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        ToolServerManager { inner }.on_transport_event(event);
    }
}

fn server_tools(entry: &ServerEntry) -> Vec<ServerTool> {
    entry
        .tools()
        .into_iter()
        .map(|tool| ServerTool {
            server_id: entry.id().to_string(),
            tool,
        })
        .collect()
}

fn parse_call_result(server_id: &str, value: Value) -> Result<ToolCallResult> {
    serde_json::from_value(value).map_err(|e| OrchestratorError::Protocol {
        backend: server_id.to_string(),
        reason: format!("malformed tools/call result: {e}"),
    })
}
