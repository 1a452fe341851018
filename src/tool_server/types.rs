//! Tool server protocol and execution types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// A tool exposed by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

impl Tool {
    /// Names listed under `inputSchema.required`.
    pub fn required_params(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Required parameters absent from `params`, in schema order.
    pub fn missing_params(&self, params: &Value) -> Vec<String> {
        let present = params.as_object();
        self.required_params()
            .into_iter()
            .filter(|name| present.map_or(true, |p| !p.contains_key(*name)))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// Everything discovered from one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerCapabilities {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
}

/// A tool together with the server exposing it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerTool {
    pub server_id: String,
    pub tool: Tool,
}

/// Result payload of `tools/call`.
///
/// `is_error` reports a failure inside the tool; the call itself succeeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Overrides the server's configured timeout.
    pub timeout: Option<Duration>,
    pub cancellable: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cancellable: true,
        }
    }
}

impl ExecutionOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub current: f64,
    pub total: Option<f64>,
    pub message: Option<String>,
}

/// A tool call in flight.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub request_id: Uuid,
    pub server_id: String,
    pub tool: String,
    pub params: Value,
    pub progress: Option<Progress>,
    pub status: ExecutionStatus,
    pub cancellable: bool,
    pub started_at: SystemTime,
}

/// A completed tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub server_id: String,
    pub tool: String,
    pub result: ToolCallResult,
    pub duration: Duration,
}
