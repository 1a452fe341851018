//! Socket transport: one JSON-RPC message per text frame.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::{ToolServerConfig, TransportKind};
use crate::error::{OrchestratorError, Result};
use crate::transport::jsonrpc::{JsonRpcNotification, PendingRequests};
use crate::transport::{endpoint, EventSink, Transport};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WebSocketTransport {
    server_id: String,
    url: Url,
    headers: HashMap<String, String>,
    sink: EventSink,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    writer: tokio::sync::Mutex<Option<WsWriter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(config: &ToolServerConfig, sink: EventSink) -> Result<Self> {
        Ok(Self {
            server_id: config.id.clone(),
            url: endpoint(config)?,
            headers: config.headers.clone(),
            sink,
            pending: Arc::new(PendingRequests::new(config.id.clone())),
            connected: Arc::new(AtomicBool::new(false)),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    fn connection_error(&self, reason: String) -> OrchestratorError {
        OrchestratorError::Connection {
            backend: self.server_id.clone(),
            reason,
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.connection_error("transport is not connected".into()))?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| OrchestratorError::ConnectionClosed {
                backend: self.server_id.clone(),
                reason: format!("failed to send frame: {e}"),
            })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| self.connection_error(format!("invalid socket request: {e}")))?;
        for (name, value) in &self.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(header), Ok(value)) => {
                    request.headers_mut().insert(header, value);
                }
                _ => tracing::warn!(server = %self.server_id, header = %name, "Skipping invalid header"),
            }
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| self.connection_error(format!("socket connect failed: {e}")))?;
        let (writer, mut read) = stream.split();

        self.pending.open();
        self.connected.store(true, Ordering::SeqCst);
        *self.writer.lock().await = Some(writer);

        let reader = {
            let pending = self.pending.clone();
            let connected = self.connected.clone();
            let sink = self.sink.clone();
            tokio::spawn(async move {
                let mut reason = "socket closed".to_string();
                while let Some(frame) = read.next().await {
                    match frame {
                        Ok(Message::Text(text)) => pending.dispatch(text.as_str(), &sink),
                        Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                            Ok(text) => pending.dispatch(text, &sink),
                            Err(_) => tracing::debug!(server = sink.server_id(), "Skipping non-utf8 binary frame"),
                        },
                        Ok(Message::Close(frame)) => {
                            if let Some(frame) = frame {
                                reason = format!("socket closed: {}", frame.reason.as_str());
                            }
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            reason = format!("socket error: {e}");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                pending.fail_all(&reason);
                sink.closed(reason);
            })
        };
        *self.reader.lock().expect("reader mutex poisoned") = Some(reader);

        tracing::info!(server = %self.server_id, url = %self.url, "Socket connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().expect("reader mutex poisoned").take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        self.pending.fail_all("transport disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(self.connection_error("transport is not connected".into()));
        }
        self.pending
            .round_trip(method, params, timeout, |text| self.send_text(text))
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.is_connected() {
            return Err(self.connection_error("transport is not connected".into()));
        }
        let text = serde_json::to_string(&JsonRpcNotification::new(method, params)).map_err(|e| {
            OrchestratorError::Protocol {
                backend: self.server_id.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        self.send_text(text).await
    }
}
