//! Stdio transport against small shell-script servers.
#![cfg(unix)]

use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

use backend_orchestrator::config::{CacheConfig, CircuitBreakerConfig, HealthCheckConfig, ToolServerConfig};
use backend_orchestrator::error::OrchestratorError;
use backend_orchestrator::state::ConnectionStatus;
use backend_orchestrator::tool_server::{ExecutionOptions, ToolServerManager};
use backend_orchestrator::transport::{EventSink, StdioTransport, Transport, TransportEventKind};

/// Answers initialize, tools/list and tools/call; everything else is an error.
const ECHO_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"sh-echo"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object","required":["text"]}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"method not found"}}\n' "$id" ;;
  esac
done
"#;

fn shell_server(id: &str, script: &str) -> ToolServerConfig {
    ToolServerConfig::stdio(id, "sh", vec!["-c".into(), script.into()])
}

#[tokio::test]
async fn test_manager_drives_stdio_server() {
    let health = HealthCheckConfig {
        enabled: false,
        ..HealthCheckConfig::default()
    };
    let manager = ToolServerManager::new(CircuitBreakerConfig::default(), health, &CacheConfig::default());
    manager.add_server(shell_server("echo", ECHO_SERVER)).await.unwrap();

    let status = &manager.get_server_status(Some("echo")).unwrap()[0];
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert_eq!(status.server_name.as_deref(), Some("sh-echo"));
    // resources/list and prompts/list fail; discovery tolerates it.
    assert_eq!(status.tools, 1);
    assert_eq!(status.resources, 0);

    let executed = manager
        .execute_tool("echo", "echo", json!({"text": "ping"}), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(executed.result.content[0]["text"], "pong");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_process_exit_fails_pending_and_reports_close() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = shell_server("quitter", "read line; exit 0");
    let transport = StdioTransport::new(&config, EventSink::new("quitter", tx));
    transport.connect().await.unwrap();
    assert!(transport.is_connected());

    let err = transport
        .request("initialize", None, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ConnectionClosed { .. }), "got {err}");

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.server_id, "quitter");
    assert!(matches!(event.kind, TransportEventKind::Closed { .. }));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_spawn_failure_is_a_connection_error() {
    let config = ToolServerConfig::stdio("missing", "/nonexistent/tool-server", vec![]);
    let transport = StdioTransport::new(&config, EventSink::detached("missing"));
    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Connection { .. }));
}

#[tokio::test]
async fn test_disconnect_emits_no_close_event() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = shell_server("echo", ECHO_SERVER);
    let transport = StdioTransport::new(&config, EventSink::new("echo", tx));
    transport.connect().await.unwrap();
    transport.disconnect().await.unwrap();

    assert!(!transport.is_connected());
    let waited = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(waited.is_err() || waited.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_utf8_line_is_skipped() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let script = format!("printf '\\377\\376 garbage\\n'\n{ECHO_SERVER}");
    let config = shell_server("noisy", &script);
    let transport = StdioTransport::new(&config, EventSink::new("noisy", tx));
    transport.connect().await.unwrap();

    let result = transport
        .request("initialize", Some(json!({})), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result["serverInfo"]["name"], "sh-echo");
    assert!(transport.is_connected());
    assert!(rx.try_recv().is_err(), "no close event for a garbage line");

    transport.disconnect().await.unwrap();
}
