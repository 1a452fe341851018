//! Capability discovery after a successful handshake.
//!
//! Each list is paginated through `nextCursor`. A failing list is logged and
//! left empty; discovery itself never fails.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::ToolServerConfig;
use crate::error::{OrchestratorError, Result};
use crate::transport::Transport;
use crate::tool_server::types::{Prompt, Resource, ServerCapabilities, Tool};

/// Upper bound on pages fetched for a single list.
const MAX_PAGES: usize = 64;

pub async fn discover(transport: &dyn Transport, config: &ToolServerConfig) -> ServerCapabilities {
    let flags = &config.capabilities;
    let timeout = config.timeout();
    let id = config.id.as_str();

    let (tools, resources, prompts) = tokio::join!(
        async {
            if flags.tools {
                list_or_warn::<Tool>(transport, id, "tools/list", "tools", timeout).await
            } else {
                Vec::new()
            }
        },
        async {
            if flags.resources {
                list_or_warn::<Resource>(transport, id, "resources/list", "resources", timeout).await
            } else {
                Vec::new()
            }
        },
        async {
            if flags.prompts {
                list_or_warn::<Prompt>(transport, id, "prompts/list", "prompts", timeout).await
            } else {
                Vec::new()
            }
        },
    );

    tracing::debug!(
        server = %id,
        tools = tools.len(),
        resources = resources.len(),
        prompts = prompts.len(),
        "Capabilities discovered"
    );
    ServerCapabilities { tools, resources, prompts }
}

async fn list_or_warn<T: DeserializeOwned>(
    transport: &dyn Transport,
    server: &str,
    method: &str,
    key: &str,
    timeout: Duration,
) -> Vec<T> {
    match list_all(transport, server, method, key, timeout).await {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(server = %server, method, error = %e, "Capability discovery failed");
            Vec::new()
        }
    }
}

/// Fetch every page of a `*/list` method.
pub async fn list_all<T: DeserializeOwned>(
    transport: &dyn Transport,
    server: &str,
    method: &str,
    key: &str,
    timeout: Duration,
) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let page = transport.request(method, params, timeout).await?;

        let entries = page.get(key).and_then(Value::as_array).ok_or_else(|| OrchestratorError::Protocol {
            backend: server.to_string(),
            reason: format!("{method} response has no '{key}' array"),
        })?;
        for entry in entries {
            match serde_json::from_value::<T>(entry.clone()) {
                Ok(item) => items.push(item),
                Err(e) => tracing::debug!(server = %server, method, error = %e, "Skipping malformed entry"),
            }
        }

        match page.get("nextCursor").and_then(Value::as_str) {
            Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
            _ => return Ok(items),
        }
    }

    tracing::warn!(server = %server, method, pages = MAX_PAGES, "Pagination limit reached");
    Ok(items)
}
