//! Events published by the tool-server manager.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::state::ConnectionStatus;
use crate::tool_server::types::{ExecutionStatus, Progress};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerEvent {
    ServerAdded {
        server_id: String,
    },
    ServerRemoved {
        server_id: String,
    },
    StatusChanged {
        server_id: String,
        status: ConnectionStatus,
    },
    ServerConnected {
        server_id: String,
        tools: usize,
        resources: usize,
        prompts: usize,
    },
    ServerDisconnected {
        server_id: String,
    },
    ServerError {
        server_id: String,
        error: String,
    },
    ReconnectScheduled {
        server_id: String,
        attempt: u32,
        delay: Duration,
    },
    ToolsChanged {
        server_id: String,
        tools: usize,
    },
    ExecutionStarted {
        request_id: Uuid,
        server_id: String,
        tool: String,
    },
    ExecutionProgress {
        request_id: Uuid,
        progress: Progress,
    },
    ExecutionCompleted {
        request_id: Uuid,
        duration: Duration,
        is_error: bool,
    },
    /// `status` is `failed` or `timed_out`.
    ExecutionFailed {
        request_id: Uuid,
        status: ExecutionStatus,
        error: String,
    },
    ExecutionCancelled {
        request_id: Uuid,
    },
    /// Any other server notification, passed through untouched.
    Notification {
        server_id: String,
        method: String,
        params: Option<Value>,
    },
}
