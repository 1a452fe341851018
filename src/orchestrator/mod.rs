//! Completion provider orchestrator.
//!
//! # Data Flow
//! ```text
//! complete(request)
//!     → BackendPool::candidates (strategy order; full registry if none healthy)
//!     → per candidate:
//!         Resilience::before_call (rate limit, circuit state)
//!         → with_retry(with_timeout(provider.complete))
//!         → record outcome on backend, breaker, metrics
//!     → first success returns; exhaustion → AllBackendsFailed
//! ```
//!
//! # Design Decisions
//! - Candidates are tried strictly in order, one at a time
//! - Retries happen inside a candidate; the breaker sees one outcome per candidate
//! - Streams fail over only before their first chunk

pub mod context;
pub mod events;
mod health;
mod metered;

use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::validation::validate_provider;
use crate::config::{CircuitBreakerConfig, HealthCheckConfig, OrchestratorConfig, ProviderConfig, StrategyKind};
use crate::error::{OrchestratorError, Result};
use crate::health::HealthMonitor;
use crate::lifecycle::Shutdown;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::BackendPool;
use crate::providers::{
    build_provider, ChunkStream, CompletionProvider, CompletionRequest, CompletionResponse,
    StreamChunk,
};
use crate::resilience::{with_retry, with_timeout};

pub use context::RequestContext;
pub use events::OrchestratorEvent;
pub use health::ProviderHealth;

const EVENT_CAPACITY: usize = 256;

struct Inner {
    pool: BackendPool,
    breaker: CircuitBreakerConfig,
    health_check: HealthCheckConfig,
    events: broadcast::Sender<OrchestratorEvent>,
    shutdown: Shutdown,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Routes completion requests across registered providers.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(strategy: StrategyKind, breaker: CircuitBreakerConfig, health_check: HealthCheckConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                pool: BackendPool::new(strategy),
                breaker,
                health_check,
                events,
                shutdown: Shutdown::new(),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Build an orchestrator and register every provider in `config`.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let orchestrator = Self::new(
            config.strategy,
            config.circuit_breaker.clone(),
            config.health_check.clone(),
        );
        for provider in &config.providers {
            orchestrator.register_provider(provider.clone())?;
        }
        Ok(orchestrator)
    }

    /// Validate, build and register a provider. Re-registering an id replaces it.
    pub fn register_provider(&self, config: ProviderConfig) -> Result<()> {
        validate_provider(&config).map_err(OrchestratorError::Config)?;
        let provider = build_provider(&config)?;
        self.register_provider_with(config, provider)
    }

    /// Register a caller-supplied provider implementation.
    pub fn register_provider_with(&self, config: ProviderConfig, provider: Arc<dyn CompletionProvider>) -> Result<()> {
        validate_provider(&config).map_err(OrchestratorError::Config)?;
        let id = config.id.clone();
        let backend = Arc::new(Backend::new(config, provider, &self.inner.breaker));
        let replaced = self.inner.pool.insert(backend).is_some();

        tracing::info!(provider = %id, replaced, "Provider registered");
        self.emit(OrchestratorEvent::ProviderRegistered { provider_id: id });
        Ok(())
    }

    pub fn unregister_provider(&self, id: &str) -> Result<()> {
        self.inner
            .pool
            .remove(id)
            .ok_or_else(|| OrchestratorError::NotFound { backend: id.to_string() })?;
        tracing::info!(provider = %id, "Provider unregistered");
        self.emit(OrchestratorEvent::ProviderUnregistered { provider_id: id.to_string() });
        Ok(())
    }

    /// Registered provider ids in registration order.
    pub fn provider_ids(&self) -> Vec<String> {
        self.inner.pool.all().iter().map(|b| b.id.clone()).collect()
    }

    pub fn set_strategy(&self, kind: StrategyKind) {
        self.inner.pool.set_strategy(kind);
        tracing::info!(strategy = ?kind, "Selection strategy changed");
        self.emit(OrchestratorEvent::StrategyChanged { strategy: kind });
    }

    pub fn strategy(&self) -> StrategyKind {
        self.inner.pool.strategy()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// Run one request against the pool with failover.
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let mut ctx = RequestContext::new();
        let candidates = self.candidates(&ctx)?;
        let mut last_error = OrchestratorError::NoBackends;

        for backend in candidates {
            ctx.select(&backend.id);
            let permit = match backend.resilience.before_call() {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::debug!(provider = %backend.id, request_id = %ctx.id, error = %e, "Skipping provider");
                    self.candidate_failed(&ctx, &backend.id, &e);
                    last_error = e;
                    continue;
                }
            };
            let _in_flight = backend.track();

            let started = Instant::now();
            let provider = &*backend.provider;
            let request = &request;
            let id = backend.id.as_str();
            let timeout = backend.config.timeout();
            let outcome = with_retry(id, backend.config.max_retries, backend.config.retry_base_delay(), || async move {
                with_timeout(id, timeout, provider.complete(request)).await
            })
            .await;
            let latency = started.elapsed();

            match outcome {
                Ok(mut response) => {
                    permit.record(true, latency);
                    backend.record_success(latency, response.usage);
                    let cost = response
                        .usage
                        .map(|u| backend.config.cost_of(u.prompt_tokens, u.completion_tokens))
                        .unwrap_or_default();
                    ctx.record_success(latency, response.usage, cost);
                    ctx.finish(true);
                    response.provider_id = backend.id.clone();

                    tracing::debug!(provider = %backend.id, request_id = %ctx.id, latency = ?latency, attempts = ctx.attempts.len(), "Completion succeeded");
                    self.emit(OrchestratorEvent::RequestCompleted {
                        request_id: ctx.id,
                        provider_id: backend.id.clone(),
                        latency: ctx.elapsed(),
                        attempts: ctx.attempts.len(),
                    });
                    return Ok(response);
                }
                Err(e) => {
                    permit.record(false, latency);
                    backend.record_failure(latency, &e);
                    ctx.record_failure(latency, &e.to_string());
                    if e.is_caller_error() {
                        return Err(self.request_failed(&mut ctx, e));
                    }
                    tracing::warn!(provider = %backend.id, request_id = %ctx.id, error = %e, "Provider failed, trying next");
                    self.candidate_failed(&ctx, &backend.id, &e);
                    last_error = e;
                }
            }
        }

        Err(self.request_failed(
            &mut ctx,
            OrchestratorError::AllBackendsFailed {
                last_error: Box::new(last_error),
            },
        ))
    }

    /// Stream one request with failover before the first chunk.
    pub async fn stream_complete(&self, request: CompletionRequest) -> Result<ChunkStream> {
        let mut ctx = RequestContext::new();
        let candidates = self.candidates(&ctx)?;
        let mut last_error = OrchestratorError::NoBackends;

        for backend in candidates {
            ctx.select(&backend.id);
            let permit = match backend.resilience.before_call() {
                Ok(permit) => permit,
                Err(e) => {
                    self.candidate_failed(&ctx, &backend.id, &e);
                    last_error = e;
                    continue;
                }
            };
            let in_flight = backend.track();

            let started = Instant::now();
            let provider = &*backend.provider;
            let request = &request;
            let id = backend.id.as_str();
            let timeout = backend.config.timeout();
            let opened = with_retry(id, backend.config.max_retries, backend.config.retry_base_delay(), || async move {
                let mut stream = with_timeout(id, timeout, provider.stream(request)).await?;
                let first = with_timeout(id, timeout, async { Ok(stream.next().await) }).await?;
                match first {
                    Some(Ok(chunk)) => Ok((stream, Some(chunk))),
                    Some(Err(e)) => Err(e),
                    None => Ok((stream, None::<StreamChunk>)),
                }
            })
            .await;

            match opened {
                Ok((stream, first)) => {
                    ctx.finish(true);
                    tracing::debug!(provider = %backend.id, request_id = %ctx.id, "Stream committed");
                    let committed = metered::MeteredStream::new(
                        stream,
                        first,
                        backend.clone(),
                        permit,
                        in_flight,
                        started,
                        ctx.id,
                        ctx.attempts.len() + 1,
                        self.inner.events.clone(),
                    );
                    return Ok(committed.boxed());
                }
                Err(e) => {
                    let latency = started.elapsed();
                    permit.record(false, latency);
                    backend.record_failure(latency, &e);
                    ctx.record_failure(latency, &e.to_string());
                    if e.is_caller_error() {
                        return Err(self.request_failed(&mut ctx, e));
                    }
                    tracing::warn!(provider = %backend.id, request_id = %ctx.id, error = %e, "Stream failed before first chunk, trying next");
                    self.candidate_failed(&ctx, &backend.id, &e);
                    last_error = e;
                }
            }
        }

        Err(self.request_failed(
            &mut ctx,
            OrchestratorError::AllBackendsFailed {
                last_error: Box::new(last_error),
            },
        ))
    }

    /// Start the periodic provider probe. No-op when disabled or already running.
    pub fn start_health_checks(&self) {
        if !self.inner.health_check.enabled {
            return;
        }
        let mut monitor = self.inner.monitor.lock().expect("monitor mutex poisoned");
        if monitor.is_some() {
            return;
        }
        let task = HealthMonitor::new(self.clone(), self.inner.health_check.interval());
        *monitor = Some(tokio::spawn(task.run(self.inner.shutdown.subscribe())));
    }

    /// Stop background work. Registered providers stay usable.
    pub fn shutdown(&self) {
        self.inner.shutdown.trigger();
        if let Some(task) = self.inner.monitor.lock().expect("monitor mutex poisoned").take() {
            task.abort();
        }
        tracing::info!("Orchestrator shut down");
    }

    fn candidates(&self, ctx: &RequestContext) -> Result<Vec<Arc<Backend>>> {
        let candidates = self.inner.pool.candidates();
        if candidates.is_empty() {
            tracing::warn!(request_id = %ctx.id, "No providers registered");
            let err = OrchestratorError::AllBackendsFailed {
                last_error: Box::new(OrchestratorError::NoBackends),
            };
            self.emit(OrchestratorEvent::RequestFailed {
                request_id: ctx.id,
                error: err.to_string(),
            });
            return Err(err);
        }
        Ok(candidates)
    }

    fn candidate_failed(&self, ctx: &RequestContext, provider_id: &str, error: &OrchestratorError) {
        self.emit(OrchestratorEvent::ProviderFailed {
            request_id: ctx.id,
            provider_id: provider_id.to_string(),
            error: error.to_string(),
        });
    }

    fn request_failed(&self, ctx: &mut RequestContext, error: OrchestratorError) -> OrchestratorError {
        ctx.finish(false);
        tracing::error!(request_id = %ctx.id, attempts = ctx.attempts.len(), error = %error, "Completion request failed");
        self.emit(OrchestratorEvent::RequestFailed {
            request_id: ctx.id,
            error: error.to_string(),
        });
        error
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.inner.events.send(event);
    }
}
