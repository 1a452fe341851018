//! Connection handshake.
//!
//! After a transport connects, the client sends exactly one `initialize`
//! request and then the `notifications/initialized` notification. The
//! server is usable only once both have gone through.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::transport::Transport;

/// Protocol revision announced in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server's answer to `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "roots": { "listChanged": false },
            "sampling": {}
        },
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": CLIENT_VERSION
        }
    })
}

/// Run the handshake over an already connected transport.
pub async fn negotiate(transport: &dyn Transport, backend: &str, timeout: Duration) -> Result<InitializeResult> {
    let response = transport
        .request("initialize", Some(initialize_params()), timeout)
        .await?;

    if !response.is_object() {
        return Err(OrchestratorError::Protocol {
            backend: backend.to_string(),
            reason: format!("initialize returned a non-object result: {response}"),
        });
    }
    let result: InitializeResult =
        serde_json::from_value(response).map_err(|e| OrchestratorError::Protocol {
            backend: backend.to_string(),
            reason: format!("malformed initialize result: {e}"),
        })?;

    transport.notify("notifications/initialized", None).await?;

    tracing::debug!(
        server = backend,
        protocol = ?result.protocol_version,
        server_name = ?result.server_info.as_ref().and_then(|i| i.name.as_deref()),
        "Handshake complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_result_camel_case() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "fs", "version": "1.0"}
        }))
        .unwrap();
        assert_eq!(result.protocol_version.as_deref(), Some(PROTOCOL_VERSION));
        assert_eq!(result.server_info.unwrap().name.as_deref(), Some("fs"));
    }

    #[test]
    fn test_initialize_params_announce_client() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
    }
}
