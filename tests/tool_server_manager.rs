//! Tool-server manager behaviour over scripted in-process transports.

use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use backend_orchestrator::config::{CacheConfig, CircuitBreakerConfig, HealthCheckConfig, RateLimitConfig};
use backend_orchestrator::error::OrchestratorError;
use backend_orchestrator::health::HealthProbe;
use backend_orchestrator::state::ConnectionStatus;
use backend_orchestrator::tool_server::{ExecutionOptions, ExecutionStatus, ManagerEvent, ToolServerManager};
use backend_orchestrator::transport::{Notification, Transport};

mod common;
use common::{mcp_reply, plot_tools, server_config, ScriptedTransport};

fn manager() -> ToolServerManager {
    let health = HealthCheckConfig {
        enabled: false,
        ..HealthCheckConfig::default()
    };
    ToolServerManager::new(CircuitBreakerConfig::default(), health, &CacheConfig::default())
}

async fn wait_for(
    events: &mut broadcast::Receiver<ManagerEvent>,
    mut matches: impl FnMut(&ManagerEvent) -> bool,
) -> ManagerEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn status(manager: &ToolServerManager, id: &str) -> ConnectionStatus {
    manager.get_server_status(Some(id)).unwrap()[0].status
}

#[tokio::test]
async fn test_connect_runs_handshake_and_discovery() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    manager
        .add_server_with_transport(server_config("plotter"), transport.clone())
        .await
        .unwrap();

    assert_eq!(status(&manager, "plotter"), ConnectionStatus::Connected);
    assert_eq!(transport.requests("initialize"), 1);
    assert_eq!(transport.requests("tools/list"), 1);
    assert!(transport
        .notifications()
        .iter()
        .any(|(method, _)| method == "notifications/initialized"));

    let tools = manager.get_all_tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].server_id, "plotter");
    assert_eq!(tools[0].tool.name, "plot");

    let snapshot = &manager.get_server_status(Some("plotter")).unwrap()[0];
    assert_eq!(snapshot.server_name.as_deref(), Some("scripted"));
    assert_eq!(snapshot.tools, 1);
}

#[tokio::test]
async fn test_disabled_capabilities_are_not_listed() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    let mut config = server_config("plotter");
    config.capabilities.resources = false;
    config.capabilities.prompts = false;
    manager.add_server_with_transport(config, transport.clone()).await.unwrap();

    assert_eq!(transport.requests("tools/list"), 1);
    assert_eq!(transport.requests("resources/list"), 0);
    assert_eq!(transport.requests("prompts/list"), 0);
}

#[tokio::test]
async fn test_execute_tool_returns_result() {
    let manager = manager();
    manager
        .add_server_with_transport(server_config("plotter"), ScriptedTransport::server(plot_tools()))
        .await
        .unwrap();

    let executed = manager
        .execute_tool("plotter", "plot", json!({"x": 1, "y": 2}), ExecutionOptions::default())
        .await
        .unwrap();
    assert!(!executed.result.is_error);
    assert_eq!(executed.result.content[0]["text"], json!({"x": 1, "y": 2}).to_string());
    assert!(manager.active_executions().is_empty());

    let totals = manager.aggregate_metrics();
    assert_eq!(totals.connected, 1);
    assert_eq!(totals.successful_requests, 1);
}

#[tokio::test]
async fn test_missing_parameters_never_reach_the_server() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    manager
        .add_server_with_transport(server_config("plotter"), transport.clone())
        .await
        .unwrap();

    let err = manager
        .execute_tool("plotter", "plot", json!({"x": 1}), ExecutionOptions::default())
        .await
        .unwrap_err();
    match err {
        OrchestratorError::Validation { tool, missing } => {
            assert_eq!(tool, "plot");
            assert_eq!(missing, ["y"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.requests("tools/call"), 0);
}

#[tokio::test]
async fn test_unknown_tool() {
    let manager = manager();
    manager
        .add_server_with_transport(server_config("plotter"), ScriptedTransport::server(plot_tools()))
        .await
        .unwrap();

    let err = manager
        .execute_tool("plotter", "erase", json!({}), ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ToolNotFound { .. }));
}

#[tokio::test]
async fn test_disconnected_server_exposes_no_tools() {
    let manager = manager();
    manager
        .add_server_with_transport(server_config("plotter"), ScriptedTransport::server(plot_tools()))
        .await
        .unwrap();
    manager.disconnect_server("plotter").await.unwrap();

    assert_eq!(status(&manager, "plotter"), ConnectionStatus::Disconnected);
    assert!(manager.get_all_tools().is_empty());
    assert!(manager.list_tools(Some("plotter")).unwrap().is_empty());

    let err = manager
        .execute_tool("plotter", "plot", json!({"x": 1, "y": 2}), ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Connection { .. }));
}

#[tokio::test]
async fn test_execution_timeout() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    transport.set_call_delay(Duration::from_secs(5));
    manager
        .add_server_with_transport(server_config("plotter"), transport)
        .await
        .unwrap();
    let mut events = manager.subscribe();

    let err = manager
        .execute_tool(
            "plotter",
            "plot",
            json!({"x": 1, "y": 2}),
            ExecutionOptions::with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Timeout { .. }));
    assert!(manager.active_executions().is_empty());
    assert_eq!(manager.aggregate_metrics().failed_requests, 1);

    let failed = wait_for(&mut events, |e| matches!(e, ManagerEvent::ExecutionFailed { .. })).await;
    let ManagerEvent::ExecutionFailed { status, .. } = failed else {
        unreachable!()
    };
    assert_eq!(status, ExecutionStatus::TimedOut);
}

#[tokio::test]
async fn test_cancel_running_execution() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    transport.set_call_delay(Duration::from_secs(5));
    manager
        .add_server_with_transport(server_config("plotter"), transport.clone())
        .await
        .unwrap();
    let mut events = manager.subscribe();

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .execute_tool("plotter", "plot", json!({"x": 1, "y": 2}), ExecutionOptions::default())
                .await
        })
    };

    let started = wait_for(&mut events, |e| matches!(e, ManagerEvent::ExecutionStarted { .. })).await;
    let ManagerEvent::ExecutionStarted { request_id, .. } = started else {
        unreachable!()
    };
    assert_eq!(manager.active_executions().len(), 1);
    assert!(manager.cancel_execution(request_id).await);

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled { .. }));
    assert!(manager.active_executions().is_empty());
    assert!(transport
        .notifications()
        .iter()
        .any(|(method, _)| method == "notifications/cancelled"));
    assert!(!manager.cancel_execution(request_id).await);
}

#[tokio::test]
async fn test_progress_notifications_update_execution() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    transport.set_call_delay(Duration::from_millis(300));
    manager
        .add_server_with_transport(server_config("plotter"), transport)
        .await
        .unwrap();
    let mut events = manager.subscribe();

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .execute_tool("plotter", "plot", json!({"x": 1, "y": 2}), ExecutionOptions::default())
                .await
        })
    };
    let started = wait_for(&mut events, |e| matches!(e, ManagerEvent::ExecutionStarted { .. })).await;
    let ManagerEvent::ExecutionStarted { request_id, .. } = started else {
        unreachable!()
    };

    manager.event_sink("plotter").notification(Notification {
        method: "notifications/progress".into(),
        params: Some(json!({"progressToken": request_id.to_string(), "progress": 5, "total": 10})),
    });

    let event = wait_for(&mut events, |e| matches!(e, ManagerEvent::ExecutionProgress { .. })).await;
    let ManagerEvent::ExecutionProgress { progress, .. } = event else {
        unreachable!()
    };
    assert_eq!(progress.current, 5.0);
    assert_eq!(progress.total, Some(10.0));

    assert!(running.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_call_tool_fails_over_between_servers() {
    let manager = manager();
    let broken = ScriptedTransport::new(|method, params| {
        if method == "tools/call" {
            return Err(OrchestratorError::Backend {
                backend: "a".into(),
                message: "boom".into(),
            });
        }
        mcp_reply(&plot_tools(), method, params)
    });
    manager.add_server_with_transport(server_config("a"), broken).await.unwrap();
    manager
        .add_server_with_transport(server_config("b"), ScriptedTransport::server(plot_tools()))
        .await
        .unwrap();

    let executed = manager
        .call_tool("plot", json!({"x": 1, "y": 2}), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(executed.server_id, "b");

    let a = &manager.get_server_status(Some("a")).unwrap()[0];
    assert_eq!(a.metrics.failed_requests, 1);
}

#[tokio::test]
async fn test_call_tool_skips_rate_limited_server() {
    let manager = manager();
    let mut limited = server_config("a");
    limited.rate_limit = RateLimitConfig {
        requests_per_minute: Some(1),
        requests_per_hour: None,
    };
    let a = ScriptedTransport::server(plot_tools());
    let b = ScriptedTransport::server(plot_tools());
    manager.add_server_with_transport(limited, a.clone()).await.unwrap();
    manager.add_server_with_transport(server_config("b"), b.clone()).await.unwrap();

    let first = manager
        .call_tool("plot", json!({"x": 1, "y": 2}), ExecutionOptions::default())
        .await
        .unwrap();
    let second = manager
        .call_tool("plot", json!({"x": 3, "y": 4}), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(first.server_id, "a");
    assert_eq!(second.server_id, "b");
    assert_eq!(a.requests("tools/call"), 1);
    assert_eq!(b.requests("tools/call"), 1);
}

#[tokio::test]
async fn test_failed_execution_reports_failed_status() {
    let manager = manager();
    let broken = ScriptedTransport::new(|method, params| {
        if method == "tools/call" {
            return Err(OrchestratorError::Backend {
                backend: "a".into(),
                message: "boom".into(),
            });
        }
        mcp_reply(&plot_tools(), method, params)
    });
    manager.add_server_with_transport(server_config("a"), broken).await.unwrap();
    let mut events = manager.subscribe();

    let err = manager
        .execute_tool("a", "plot", json!({"x": 1, "y": 2}), ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Backend { .. }));

    let failed = wait_for(&mut events, |e| matches!(e, ManagerEvent::ExecutionFailed { .. })).await;
    let ManagerEvent::ExecutionFailed { status, error, .. } = failed else {
        unreachable!()
    };
    assert_eq!(status, ExecutionStatus::Failed);
    assert!(error.contains("boom"));
}

#[tokio::test]
async fn test_reconnects_after_failed_connect() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    transport.fail_connect.store(true, Ordering::SeqCst);
    let mut events = manager.subscribe();
    let mut config = server_config("flaky");
    config.retry_delay_ms = 200;

    let err = manager
        .add_server_with_transport(config, transport.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Connection { .. }));
    assert_eq!(status(&manager, "flaky"), ConnectionStatus::Reconnecting);

    transport.fail_connect.store(false, Ordering::SeqCst);
    wait_for(&mut events, |e| matches!(e, ManagerEvent::ServerConnected { .. })).await;

    let snapshot = &manager.get_server_status(Some("flaky")).unwrap()[0];
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.reconnect_count, 0);
    assert_eq!(manager.get_all_tools().len(), 1);
}

#[tokio::test]
async fn test_closed_transport_triggers_reconnect() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    manager
        .add_server_with_transport(server_config("plotter"), transport.clone())
        .await
        .unwrap();
    let mut events = manager.subscribe();

    transport.drop_connection();
    manager.event_sink("plotter").closed("process exited");

    let scheduled = wait_for(&mut events, |e| matches!(e, ManagerEvent::ReconnectScheduled { .. })).await;
    let ManagerEvent::ReconnectScheduled { attempt, .. } = scheduled else {
        unreachable!()
    };
    assert_eq!(attempt, 1);
    wait_for(&mut events, |e| matches!(e, ManagerEvent::ServerConnected { .. })).await;
    assert_eq!(transport.requests("initialize"), 2);
}

#[tokio::test]
async fn test_close_from_previous_session_is_ignored() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    manager
        .add_server_with_transport(server_config("plotter"), transport.clone())
        .await
        .unwrap();

    // The transport is still connected, so this close is stale.
    manager.event_sink("plotter").closed("old reader finished");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status(&manager, "plotter"), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_failed_ping_marks_server_error() {
    let manager = manager();
    let transport = ScriptedTransport::new(|method, params| {
        if method == "ping" {
            return Err(OrchestratorError::Backend {
                backend: "plotter".into(),
                message: "unhealthy".into(),
            });
        }
        mcp_reply(&plot_tools(), method, params)
    });
    let mut config = server_config("plotter");
    config.auto_reconnect = false;
    manager.add_server_with_transport(config, transport).await.unwrap();

    manager.probe_all().await;
    assert_eq!(status(&manager, "plotter"), ConnectionStatus::Error);
    assert!(manager.get_all_tools().is_empty());
}

#[tokio::test]
async fn test_tools_list_changed_triggers_rediscovery() {
    let manager = manager();
    let tools = Arc::new(Mutex::new(plot_tools()));
    let listed = tools.clone();
    let transport = ScriptedTransport::new(move |method, params| {
        let current: Value = listed.lock().unwrap().clone();
        mcp_reply(&current, method, params)
    });
    manager
        .add_server_with_transport(server_config("plotter"), transport)
        .await
        .unwrap();
    let mut events = manager.subscribe();

    tools
        .lock()
        .unwrap()
        .as_array_mut()
        .unwrap()
        .push(json!({"name": "erase", "inputSchema": {"type": "object"}}));
    manager.event_sink("plotter").notification(Notification {
        method: "notifications/tools/list_changed".into(),
        params: None,
    });

    let changed = wait_for(&mut events, |e| matches!(e, ManagerEvent::ToolsChanged { .. })).await;
    let ManagerEvent::ToolsChanged { tools, .. } = changed else {
        unreachable!()
    };
    assert_eq!(tools, 2);
    assert_eq!(manager.get_all_tools().len(), 2);
}

#[tokio::test]
async fn test_resource_reads_are_cached() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    manager
        .add_server_with_transport(server_config("plotter"), transport.clone())
        .await
        .unwrap();

    let first = manager.read_resource("plotter", "file:///chart.png").await.unwrap();
    let second = manager.read_resource("plotter", "file:///chart.png").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(transport.requests("resources/read"), 1);

    manager.disconnect_server("plotter").await.unwrap();
    assert!(matches!(
        manager.read_resource("plotter", "file:///chart.png").await,
        Err(OrchestratorError::Connection { .. })
    ));
}

#[tokio::test]
async fn test_remove_server() {
    let manager = manager();
    manager
        .add_server_with_transport(server_config("plotter"), ScriptedTransport::server(plot_tools()))
        .await
        .unwrap();
    manager.remove_server("plotter").await.unwrap();

    assert!(manager.server_ids().is_empty());
    assert!(matches!(
        manager.get_server_status(Some("plotter")),
        Err(OrchestratorError::NotFound { .. })
    ));
    assert!(matches!(
        manager.remove_server("plotter").await,
        Err(OrchestratorError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let manager = manager();
    let mut config = server_config("broken");
    config.command = Some(String::new());
    let err = manager
        .add_server_with_transport(config, ScriptedTransport::server(plot_tools()))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Config(_)));
    assert!(manager.server_ids().is_empty());
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let manager = manager();
    let transport = ScriptedTransport::server(plot_tools());
    manager
        .add_server_with_transport(server_config("plotter"), transport.clone())
        .await
        .unwrap();

    manager.shutdown().await;
    assert_eq!(status(&manager, "plotter"), ConnectionStatus::Disconnected);
    assert!(!transport.is_connected());
}
