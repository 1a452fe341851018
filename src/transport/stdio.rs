//! Subprocess transport: line-delimited JSON-RPC over the child's stdio.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::config::{ToolServerConfig, TransportKind};
use crate::error::{OrchestratorError, Result};
use crate::transport::jsonrpc::{JsonRpcNotification, PendingRequests};
use crate::transport::{EventSink, Transport};

pub struct StdioTransport {
    server_id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    sink: EventSink,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn new(config: &ToolServerConfig, sink: EventSink) -> Self {
        Self {
            server_id: config.id.clone(),
            command: config.command.clone().unwrap_or_default(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
            sink,
            pending: Arc::new(PendingRequests::new(config.id.clone())),
            connected: Arc::new(AtomicBool::new(false)),
            stdin: tokio::sync::Mutex::new(None),
            child: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn write_line(&self, mut line: String) -> Result<()> {
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| self.not_connected())?;
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        written.map_err(|e| OrchestratorError::ConnectionClosed {
            backend: self.server_id.clone(),
            reason: format!("failed to write to stdin: {e}"),
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
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| OrchestratorError::Connection {
            backend: self.server_id.clone(),
            reason: format!("failed to spawn '{}': {e}", self.command),
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(OrchestratorError::Connection {
                backend: self.server_id.clone(),
                reason: "child process stdio was not captured".into(),
            });
        };

        tracing::info!(server = %self.server_id, command = %self.command, pid = ?child.id(), "Spawned tool server process");

        self.pending.open();
        self.connected.store(true, Ordering::SeqCst);
        *self.stdin.lock().await = Some(stdin);

        let reader = {
            let pending = self.pending.clone();
            let connected = self.connected.clone();
            let sink = self.sink.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf).await {
                        Ok(0) => break,
                        Ok(_) => {
                            // Invalid UTF-8 decodes lossily and fails JSON parsing in dispatch.
                            let line = String::from_utf8_lossy(&buf);
                            if !line.trim().is_empty() {
                                pending.dispatch(&line, &sink);
                            }
                        }
                        Err(e) => {
                            tracing::debug!(server = sink.server_id(), error = %e, "stdout read failed");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                pending.fail_all("server process exited");
                sink.closed("server process exited");
            })
        };

        let logger = {
            let server_id = self.server_id.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Ok(n) = reader.read_until(b'\n', &mut buf).await {
                    if n == 0 {
                        break;
                    }
                    tracing::debug!(server = %server_id, "stderr: {}", String::from_utf8_lossy(&buf).trim_end());
                    buf.clear();
                }
            })
        };

        *self.child.lock().expect("child mutex poisoned") = Some(child);
        *self.tasks.lock().expect("tasks mutex poisoned") = vec![reader, logger];
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().expect("tasks mutex poisoned").drain(..) {
            task.abort();
        }
        self.stdin.lock().await.take();

        let child = self.child.lock().expect("child mutex poisoned").take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::debug!(server = %self.server_id, error = %e, "Failed to kill tool server process");
            }
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
            .round_trip(method, params, timeout, |line| self.write_line(line))
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params)).map_err(|e| {
            OrchestratorError::Protocol {
                backend: self.server_id.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        self.write_line(line).await
    }
}
