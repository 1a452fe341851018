//! Request/response HTTP transport.
//!
//! Each request is one POST whose body is the JSON-RPC response, so there
//! is no pending table and no inbound notification path.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use url::Url;

use crate::config::{ToolServerConfig, TransportKind};
use crate::error::{OrchestratorError, Result};
use crate::transport::jsonrpc::{into_result, parse_inbound, Inbound, JsonRpcNotification, JsonRpcRequest};
use crate::transport::{endpoint, http_client, Transport};

pub struct HttpTransport {
    server_id: String,
    url: Url,
    client: reqwest::Client,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: &ToolServerConfig) -> Result<Self> {
        Ok(Self {
            server_id: config.id.clone(),
            url: endpoint(config)?,
            client: http_client(config)?,
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        })
    }

    fn not_connected(&self) -> OrchestratorError {
        OrchestratorError::Connection {
            backend: self.server_id.clone(),
            reason: "transport is not connected".into(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    /// Nothing to open; reachability is established by the handshake.
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let response = self
            .client
            .post(self.url.clone())
            .json(&JsonRpcRequest::new(id, method, params))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OrchestratorError::Timeout {
                        backend: self.server_id.clone(),
                        after: timeout,
                    }
                } else {
                    OrchestratorError::Connection {
                        backend: self.server_id.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::Backend {
                backend: self.server_id.clone(),
                message: format!("http status {status}"),
            });
        }

        let body = response.text().await.map_err(|e| OrchestratorError::ConnectionClosed {
            backend: self.server_id.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        match parse_inbound(&body) {
            Some(Inbound::Response { outcome, .. }) => into_result(&self.server_id, outcome),
            _ => Err(OrchestratorError::Protocol {
                backend: self.server_id.clone(),
                reason: "response body is not a JSON-RPC response".into(),
            }),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        let request = self
            .client
            .post(self.url.clone())
            .json(&JsonRpcNotification::new(method, params));
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            if let Err(e) = request.send().await {
                tracing::debug!(server = %server_id, error = %e, "Notification post failed");
            }
        });
        Ok(())
    }
}
