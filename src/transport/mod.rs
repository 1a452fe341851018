//! Wire transports to tool servers.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     ToolServerManager → Transport::request(method, params, timeout)
//!     → jsonrpc.rs assigns an id and a pending waiter
//!     → stdio / sse / websocket / http writes the frame
//!
//! Inbound:
//!     reader task → jsonrpc.rs dispatch
//!     → response with id: resolve pending waiter
//!     → message without id: TransportEvent::Notification to the manager
//!     → stream closed: reject all pending, TransportEvent::Closed
//! ```
//!
//! # Design Decisions
//! - One trait, four implementations; the manager never knows which
//! - Pending tables are owned by their transport
//! - Intentional disconnects stop the reader first and emit no Closed event

pub mod handshake;
pub mod http;
pub mod jsonrpc;
pub mod sse;
pub mod stdio;
pub mod websocket;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{ToolServerConfig, TransportKind};
use crate::error::{OrchestratorError, Result};

pub use handshake::{negotiate, InitializeResult, PROTOCOL_VERSION};
pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

/// Bidirectional request/notification channel to one tool server.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Send a request and wait for its result, failing with `Timeout` after `timeout`.
    async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;
}

/// Inbound message without an id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum TransportEventKind {
    Notification(Notification),
    /// The stream ended without a call to `disconnect`.
    Closed { reason: String },
}

/// Something a transport reports to its owner.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub server_id: String,
    pub kind: TransportEventKind,
}

/// Where a transport delivers its events.
#[derive(Clone)]
pub struct EventSink {
    server_id: Arc<str>,
    tx: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl EventSink {
    pub fn new(server_id: &str, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            server_id: Arc::from(server_id),
            tx: Some(tx),
        }
    }

    /// A sink that drops every event.
    pub fn detached(server_id: &str) -> Self {
        Self {
            server_id: Arc::from(server_id),
            tx: None,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn notification(&self, notification: Notification) {
        self.emit(TransportEventKind::Notification(notification));
    }

    pub fn closed(&self, reason: impl Into<String>) {
        self.emit(TransportEventKind::Closed { reason: reason.into() });
    }

    fn emit(&self, kind: TransportEventKind) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(TransportEvent {
                server_id: self.server_id.to_string(),
                kind,
            });
        }
    }
}

/// Build the transport selected by `config.transport`.
pub fn create_transport(config: &ToolServerConfig, sink: EventSink) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config.transport {
        TransportKind::Stdio => Arc::new(StdioTransport::new(config, sink)),
        TransportKind::Sse => Arc::new(SseTransport::new(config, sink)?),
        TransportKind::Websocket => Arc::new(WebSocketTransport::new(config, sink)?),
        TransportKind::Http => Arc::new(HttpTransport::new(config)?),
    };
    Ok(transport)
}

/// The configured endpoint of a network transport.
pub(crate) fn endpoint(config: &ToolServerConfig) -> Result<url::Url> {
    let raw = config.url.as_deref().unwrap_or_default();
    url::Url::parse(raw).map_err(|e| OrchestratorError::Connection {
        backend: config.id.clone(),
        reason: format!("invalid url '{raw}': {e}"),
    })
}

/// Shared reqwest client with the configured headers applied.
pub(crate) fn http_client(config: &ToolServerConfig) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &config.headers {
        match (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            (Ok(header), Ok(value)) => {
                headers.insert(header, value);
            }
            _ => tracing::warn!(server = %config.id, header = %name, "Skipping invalid header"),
        }
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| OrchestratorError::Connection {
            backend: config.id.clone(),
            reason: format!("failed to build http client: {e}"),
        })
}
