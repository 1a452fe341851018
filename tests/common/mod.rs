//! Shared helpers for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use backend_orchestrator::config::{ProviderConfig, ProviderKind, ToolServerConfig, TransportKind};
use backend_orchestrator::error::{OrchestratorError, Result};
use backend_orchestrator::providers::{
    ChunkStream, CompletionProvider, CompletionRequest, CompletionResponse, StreamChunk, TokenUsage,
};
use backend_orchestrator::transport::Transport;

/// Provider config with retries disabled so failures fail over immediately.
pub fn provider_config(id: &str) -> ProviderConfig {
    let mut config = ProviderConfig::new(id, ProviderKind::Custom);
    config.max_retries = 0;
    config
}

/// In-process completion provider with a fixed behaviour.
pub struct MockProvider {
    id: String,
    reply: std::result::Result<String, OrchestratorError>,
    pub calls: AtomicU32,
}

impl MockProvider {
    pub fn ok(id: &str, content: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            reply: Ok(content.to_string()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn failing(id: &str) -> Arc<Self> {
        Self::with_error(
            id,
            OrchestratorError::Backend {
                backend: id.to_string(),
                message: "injected failure".into(),
            },
        )
    }

    pub fn with_error(id: &str, error: OrchestratorError) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            reply: Err(error),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self.reply.clone()?;
        Ok(CompletionResponse {
            id: format!("{}-1", self.id),
            provider_id: String::new(),
            model: "mock".into(),
            content,
            finish_reason: Some("stop".into()),
            usage: Some(TokenUsage {
                prompt_tokens: 3,
                completion_tokens: 2,
            }),
        })
    }

    async fn stream(&self, _request: &CompletionRequest) -> Result<ChunkStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self.reply.clone()?;
        let chunks: Vec<Result<StreamChunk>> = content
            .split_inclusive(' ')
            .map(|piece| {
                Ok(StreamChunk {
                    delta: piece.to_string(),
                    ..StreamChunk::default()
                })
            })
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

type Handler = dyn Fn(&str, Option<Value>) -> Result<Value> + Send + Sync;

/// In-process tool server answering requests through a closure.
pub struct ScriptedTransport {
    handler: Box<Handler>,
    delay: Mutex<Option<Duration>>,
    connected: AtomicBool,
    pub fail_connect: AtomicBool,
    requests: Mutex<Vec<(String, Option<Value>)>>,
    notifications: Mutex<Vec<(String, Option<Value>)>>,
}

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&str, Option<Value>) -> Result<Value> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            delay: Mutex::new(None),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        })
    }

    /// A well-behaved server exposing `tools`; `tools/call` echoes its arguments.
    pub fn server(tools: Value) -> Arc<Self> {
        Self::new(move |method, params| mcp_reply(&tools, method, params))
    }

    /// Delay applied to `tools/call` only.
    pub fn set_call_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self, method: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|(m, _)| m == method).count()
    }

    pub fn notifications(&self) -> Vec<(String, Option<Value>)> {
        self.notifications.lock().unwrap().clone()
    }

    /// Simulate the remote side going away.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Connection {
                backend: "scripted".into(),
                reason: "refused".into(),
            });
        }
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
            return Err(OrchestratorError::ConnectionClosed {
                backend: "scripted".into(),
                reason: "not connected".into(),
            });
        }
        self.requests.lock().unwrap().push((method.to_string(), params.clone()));
        let delay = *self.delay.lock().unwrap();
        if let (Some(delay), "tools/call") = (delay, method) {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(OrchestratorError::Timeout {
                    backend: "scripted".into(),
                    after: timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }
        (self.handler)(method, params)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.notifications.lock().unwrap().push((method.to_string(), params));
        Ok(())
    }
}

/// Replies of a minimal MCP server.
pub fn mcp_reply(tools: &Value, method: &str, params: Option<Value>) -> Result<Value> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "scripted", "version": "1.0.0"}
        })),
        "tools/list" => Ok(json!({ "tools": tools })),
        "resources/list" => Ok(json!({ "resources": [] })),
        "prompts/list" => Ok(json!({ "prompts": [] })),
        "ping" => Ok(json!({})),
        "tools/call" => {
            let arguments = params.and_then(|p| p.get("arguments").cloned()).unwrap_or(Value::Null);
            Ok(json!({ "content": [{"type": "text", "text": arguments.to_string()}] }))
        }
        "resources/read" => {
            let uri = params.and_then(|p| p.get("uri").cloned()).unwrap_or(Value::Null);
            Ok(json!({ "contents": [{"uri": uri, "text": "hello"}] }))
        }
        other => Err(OrchestratorError::Backend {
            backend: "scripted".into(),
            message: format!("method not found: {other}"),
        }),
    }
}

/// Tool list with one tool requiring `x` and `y`.
pub fn plot_tools() -> Value {
    json!([{
        "name": "plot",
        "description": "Plot a point",
        "inputSchema": {
            "type": "object",
            "properties": {"x": {"type": "number"}, "y": {"type": "number"}},
            "required": ["x", "y"]
        }
    }])
}

pub fn server_config(id: &str) -> ToolServerConfig {
    let mut config = ToolServerConfig::stdio(id, "scripted", vec![]);
    config.retry_delay_ms = 20;
    config
}

/// Minimal HTTP/1.1 server; `f` maps a request body to `(status, content type, body)`.
pub async fn start_programmable_backend<F, Fut>(addr: SocketAddr, f: F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, &'static str, String)> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await.unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            tokio::spawn(async move {
                let Some(body) = read_request(&mut socket).await else {
                    return;
                };
                let (status, content_type, body) = f(body).await;
                let status_text = match status {
                    200 => "200 OK",
                    401 => "401 Unauthorized",
                    429 => "429 Too Many Requests",
                    500 => "500 Internal Server Error",
                    503 => "503 Service Unavailable",
                    _ => "200 OK",
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_text,
                    content_type,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let body_start = end + 4;
        while buf.len() < body_start + length {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        return Some(String::from_utf8_lossy(&buf[body_start..]).into_owned());
    }
}
