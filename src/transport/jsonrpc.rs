//! JSON-RPC 2.0 framing and the pending-request table.
//!
//! Every message-oriented transport (stdio, sse, websocket) shares this
//! code: outbound requests get a per-transport monotonically increasing id
//! and a waiter in [`PendingRequests`]; inbound messages are routed either
//! to that waiter or, when they carry no id, to the owning subsystem as a
//! notification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{OrchestratorError, Result};
use crate::transport::{EventSink, Notification};

pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Outbound notification; no response is expected.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcNotification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Well-known error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: u64,
        outcome: std::result::Result<Value, JsonRpcError>,
    },
    Notification(Notification),
    /// Server-initiated request. Not answered.
    Request { method: String },
}

/// Classify one inbound message. `None` for anything unparsable.
pub fn parse_inbound(text: &str) -> Option<Inbound> {
    let raw: RawMessage = serde_json::from_str(text.trim()).ok()?;
    match (raw.method, raw.id) {
        (Some(method), None) => Some(Inbound::Notification(Notification {
            method,
            params: raw.params,
        })),
        (Some(method), Some(_)) => Some(Inbound::Request { method }),
        (None, Some(id)) => {
            let id = match id {
                Value::Number(n) => n.as_u64()?,
                Value::String(s) => s.parse().ok()?,
                _ => return None,
            };
            let outcome = match (raw.error, raw.result) {
                (Some(error), _) => Err(error),
                (None, Some(result)) => Ok(result),
                (None, None) => Err(JsonRpcError {
                    code: error_codes::INTERNAL_ERROR,
                    message: "response missing both result and error".into(),
                    data: None,
                }),
            };
            Some(Inbound::Response { id, outcome })
        }
        (None, None) => None,
    }
}

/// Convert a response outcome into the crate's error type.
pub fn into_result(backend: &str, outcome: std::result::Result<Value, JsonRpcError>) -> Result<Value> {
    outcome.map_err(|e| OrchestratorError::Backend {
        backend: backend.to_string(),
        message: e.message,
    })
}

struct Waiters {
    open: bool,
    entries: HashMap<u64, oneshot::Sender<Result<Value>>>,
}

/// Outstanding calls of one transport, keyed by request id.
pub struct PendingRequests {
    backend: String,
    next_id: AtomicU64,
    waiters: Mutex<Waiters>,
}

impl PendingRequests {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(Waiters {
                open: false,
                entries: HashMap::new(),
            }),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Accept new registrations again after a (re)connect.
    pub fn open(&self) {
        self.waiters.lock().expect("pending mutex poisoned").open = true;
    }

    /// Allocate an id and a waiter for it.
    pub fn register(&self) -> Result<(u64, oneshot::Receiver<Result<Value>>)> {
        let mut waiters = self.waiters.lock().expect("pending mutex poisoned");
        if !waiters.open {
            return Err(OrchestratorError::ConnectionClosed {
                backend: self.backend.clone(),
                reason: "transport is not connected".into(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        waiters.entries.insert(id, tx);
        Ok((id, rx))
    }

    /// Complete a waiter. Returns false for unknown or already-removed ids.
    pub fn resolve(&self, id: u64, outcome: Result<Value>) -> bool {
        let waiter = self
            .waiters
            .lock()
            .expect("pending mutex poisoned")
            .entries
            .remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: u64) {
        self.waiters
            .lock()
            .expect("pending mutex poisoned")
            .entries
            .remove(&id);
    }

    /// Reject every outstanding call and refuse new ones until reopened.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock().expect("pending mutex poisoned");
            waiters.open = false;
            waiters.entries.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(backend = %self.backend, count = drained.len(), reason, "Rejecting pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(OrchestratorError::ConnectionClosed {
                backend: self.backend.clone(),
                reason: reason.to_string(),
            }));
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().expect("pending mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register, serialize and send a request through `send`, then wait for
    /// its response. The entry is removed on send failure and on timeout.
    pub async fn round_trip<F, Fut>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        send: F,
    ) -> Result<Value>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (id, rx) = self.register()?;
        let text = serde_json::to_string(&JsonRpcRequest::new(id, method, params)).map_err(|e| {
            self.remove(id);
            OrchestratorError::Protocol {
                backend: self.backend.clone(),
                reason: format!("failed to serialize request: {e}"),
            }
        })?;

        if let Err(e) = send(text).await {
            self.remove(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(OrchestratorError::ConnectionClosed {
                backend: self.backend.clone(),
                reason: "response channel dropped".into(),
            }),
            Err(_) => {
                self.remove(id);
                Err(OrchestratorError::Timeout {
                    backend: self.backend.clone(),
                    after: timeout,
                })
            }
        }
    }

    /// Route one inbound message.
    pub fn dispatch(&self, text: &str, sink: &EventSink) {
        match parse_inbound(text) {
            Some(Inbound::Response { id, outcome }) => {
                if !self.resolve(id, into_result(&self.backend, outcome)) {
                    tracing::debug!(backend = %self.backend, id, "Response for unknown request id");
                }
            }
            Some(Inbound::Notification(notification)) => sink.notification(notification),
            Some(Inbound::Request { method }) => {
                tracing::debug!(backend = %self.backend, %method, "Ignoring server-initiated request");
            }
            None => {
                tracing::debug!(backend = %self.backend, line = %text.trim(), "Skipping unparsable message");
            }
        }
    }
}
