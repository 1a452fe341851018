//! Committed completion stream.
//!
//! Once a candidate has produced its first chunk the orchestrator commits
//! to it and hands the caller a [`MeteredStream`]. The outcome is recorded
//! against the backend when the stream ends or errors; a stream dropped
//! early records nothing and releases its circuit-breaker slot.

use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::load_balancer::{backend::Backend, InFlightGuard};
use crate::orchestrator::events::OrchestratorEvent;
use crate::providers::{ChunkStream, StreamChunk, TokenUsage};
use crate::resilience::CallPermit;

pub(crate) struct MeteredStream {
    inner: ChunkStream,
    first: Option<StreamChunk>,
    backend: Arc<Backend>,
    permit: Option<CallPermit>,
    in_flight: Option<InFlightGuard>,
    started: Instant,
    usage: Option<TokenUsage>,
    request_id: Uuid,
    attempts: usize,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl MeteredStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        inner: ChunkStream,
        first: Option<StreamChunk>,
        backend: Arc<Backend>,
        permit: CallPermit,
        in_flight: InFlightGuard,
        started: Instant,
        request_id: Uuid,
        attempts: usize,
        events: broadcast::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            inner,
            first,
            backend,
            permit: Some(permit),
            in_flight: Some(in_flight),
            started,
            usage: None,
            request_id,
            attempts,
            events,
        }
    }

    fn observe(&mut self, chunk: &StreamChunk) {
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }

    fn finish(&mut self, error: Option<&OrchestratorError>) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let latency = self.started.elapsed();
        permit.record(error.is_none(), latency);
        self.in_flight.take();

        let event = match error {
            None => {
                self.backend.record_success(latency, self.usage);
                OrchestratorEvent::RequestCompleted {
                    request_id: self.request_id,
                    provider_id: self.backend.id.clone(),
                    latency,
                    attempts: self.attempts,
                }
            }
            Some(e) => {
                self.backend.record_failure(latency, e);
                tracing::warn!(provider = %self.backend.id, request_id = %self.request_id, error = %e, "Stream failed after first chunk");
                OrchestratorEvent::RequestFailed {
                    request_id: self.request_id,
                    error: e.to_string(),
                }
            }
        };
        let _ = self.events.send(event);
    }
}

impl Stream for MeteredStream {
    type Item = Result<StreamChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(chunk) = this.first.take() {
            this.observe(&chunk);
            return Poll::Ready(Some(Ok(chunk)));
        }
        if this.permit.is_none() {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.observe(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(Some(&e));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
