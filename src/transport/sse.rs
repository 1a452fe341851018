//! Server-push event stream transport.
//!
//! Inbound messages arrive as `data:` payloads on a long-lived GET event
//! stream. Outbound messages are POSTed; if the server announces an
//! `endpoint` event, that URL (resolved against the stream URL) is used,
//! otherwise the configured URL.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::{ToolServerConfig, TransportKind};
use crate::error::{OrchestratorError, Result};
use crate::transport::jsonrpc::{JsonRpcNotification, PendingRequests};
use crate::transport::{endpoint, http_client, EventSink, Transport};

/// How long `connect` waits for an `endpoint` event before falling back.
const ENDPOINT_GRACE: Duration = Duration::from_secs(1);

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Accepts arbitrary byte chunks; events are emitted once their terminating
/// blank line has been seen. `\r\n` line endings are accepted.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

pub struct SseTransport {
    server_id: String,
    url: Url,
    client: reqwest::Client,
    sink: EventSink,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    post_url: Arc<Mutex<Url>>,
    endpoint_ready: Arc<Notify>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(config: &ToolServerConfig, sink: EventSink) -> Result<Self> {
        let url = endpoint(config)?;
        Ok(Self {
            server_id: config.id.clone(),
            client: http_client(config)?,
            post_url: Arc::new(Mutex::new(url.clone())),
            url,
            sink,
            pending: Arc::new(PendingRequests::new(config.id.clone())),
            connected: Arc::new(AtomicBool::new(false)),
            endpoint_ready: Arc::new(Notify::new()),
            reader: Mutex::new(None),
        })
    }

    async fn post(&self, body: String) -> Result<()> {
        let url = self.post_url.lock().expect("endpoint mutex poisoned").clone();
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| OrchestratorError::Connection {
                backend: self.server_id.clone(),
                reason: format!("post failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::Backend {
                backend: self.server_id.clone(),
                message: format!("post rejected with status {status}"),
            });
        }

        // Some servers answer inline instead of on the stream.
        if let Ok(text) = response.text().await {
            if !text.trim().is_empty() {
                self.pending.dispatch(&text, &self.sink);
            }
        }
        Ok(())
    }

    fn not_connected(&self) -> OrchestratorError {
        OrchestratorError::Connection {
            backend: self.server_id.clone(),
            reason: "transport is not connected".into(),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let response = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| OrchestratorError::Connection {
                backend: self.server_id.clone(),
                reason: format!("event stream request failed: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Connection {
                backend: self.server_id.clone(),
                reason: format!("event stream rejected with status {}", response.status()),
            });
        }

        *self.post_url.lock().expect("endpoint mutex poisoned") = self.url.clone();
        self.pending.open();
        self.connected.store(true, Ordering::SeqCst);

        let reader = {
            let base = self.url.clone();
            let pending = self.pending.clone();
            let connected = self.connected.clone();
            let sink = self.sink.clone();
            let post_url = self.post_url.clone();
            let endpoint_ready = self.endpoint_ready.clone();
            let mut stream = response.bytes_stream();
            tokio::spawn(async move {
                let mut parser = SseParser::new();
                let mut reason = "event stream ended".to_string();
                while let Some(chunk) = stream.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            reason = format!("event stream failed: {e}");
                            break;
                        }
                    };
                    for event in parser.push(&chunk) {
                        match event.event.as_deref() {
                            Some("endpoint") => match base.join(event.data.trim()) {
                                Ok(url) => {
                                    tracing::debug!(server = sink.server_id(), endpoint = %url, "Received post endpoint");
                                    *post_url.lock().expect("endpoint mutex poisoned") = url;
                                    endpoint_ready.notify_one();
                                }
                                Err(e) => {
                                    tracing::warn!(server = sink.server_id(), error = %e, "Ignoring invalid endpoint event");
                                }
                            },
                            _ => pending.dispatch(&event.data, &sink),
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                pending.fail_all(&reason);
                sink.closed(reason);
            })
        };
        *self.reader.lock().expect("reader mutex poisoned") = Some(reader);

        let _ = tokio::time::timeout(ENDPOINT_GRACE, self.endpoint_ready.notified()).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().expect("reader mutex poisoned").take() {
            reader.abort();
        }
        self.pending.fail_all("transport disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        self.pending
            .round_trip(method, params, timeout, |body| self.post(body))
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        let body = serde_json::to_string(&JsonRpcNotification::new(method, params)).map_err(|e| {
            OrchestratorError::Protocol {
                backend: self.server_id.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        self.post(body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: endpoint\r\ndata: /mess").is_empty());
        let events = parser.push(b"ages?session=1\r\n\r\ndata: {\"id\":1}\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: Some("endpoint".into()),
                    data: "/messages?session=1".into()
                },
                SseEvent {
                    event: None,
                    data: "{\"id\":1}".into()
                },
            ]
        );
    }

    #[test]
    fn test_parser_joins_multiline_data_and_skips_comments() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive\n\ndata: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }
}
