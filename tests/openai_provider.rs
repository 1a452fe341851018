//! OpenAI-compatible provider against a local mock HTTP backend.

use futures_util::StreamExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use backend_orchestrator::config::{
    CircuitBreakerConfig, HealthCheckConfig, ProviderConfig, ProviderKind, StrategyKind,
};
use backend_orchestrator::error::OrchestratorError;
use backend_orchestrator::providers::{CompletionProvider, CompletionRequest, OpenAiProvider};
use backend_orchestrator::Orchestrator;

mod common;

fn config(id: &str, addr: SocketAddr) -> ProviderConfig {
    let mut config = ProviderConfig::new(id, ProviderKind::OpenAiCompatible);
    config.base_url = format!("http://{addr}/v1");
    config.model = "test-model".into();
    config.api_key = Some("sk-test".into());
    config.max_retries = 0;
    config
}

fn completion_body(content: &str) -> String {
    json!({
        "id": "cmpl-1",
        "model": "test-model",
        "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3}
    })
    .to_string()
}

#[tokio::test]
async fn test_completion_round_trip() {
    let addr: SocketAddr = "127.0.0.1:28301".parse().unwrap();
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let recorded = seen.clone();
    common::start_programmable_backend(addr, move |body| {
        let recorded = recorded.clone();
        async move {
            recorded.lock().unwrap().push(serde_json::from_str(&body).unwrap_or(Value::Null));
            (200, "application/json", completion_body("hello there"))
        }
    })
    .await;

    let provider = OpenAiProvider::new(&config("mock", addr)).unwrap();
    let response = provider.complete(&CompletionRequest::prompt("hi")).await.unwrap();

    assert_eq!(response.content, "hello there");
    assert_eq!(response.model, "test-model");
    assert_eq!(response.usage.unwrap().total(), 10);

    let bodies = seen.lock().unwrap();
    assert_eq!(bodies[0]["model"], "test-model");
    assert_eq!(bodies[0]["messages"][0]["content"], "hi");
}

#[tokio::test]
async fn test_status_codes_map_to_errors() {
    let addr: SocketAddr = "127.0.0.1:28302".parse().unwrap();
    common::start_programmable_backend(addr, |body| async move {
        if body.contains("unauthorized") {
            (401, "application/json", r#"{"error":"bad key"}"#.to_string())
        } else if body.contains("throttled") {
            (429, "application/json", r#"{"error":"slow down"}"#.to_string())
        } else {
            (500, "application/json", r#"{"error":"boom"}"#.to_string())
        }
    })
    .await;
    let provider = OpenAiProvider::new(&config("mock", addr)).unwrap();

    let err = provider.complete(&CompletionRequest::prompt("unauthorized")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Authentication { .. }), "got {err}");

    let err = provider.complete(&CompletionRequest::prompt("throttled")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RateLimited { .. }), "got {err}");

    let err = provider.complete(&CompletionRequest::prompt("other")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Backend { .. }), "got {err}");
}

#[tokio::test]
async fn test_streamed_completion() {
    let addr: SocketAddr = "127.0.0.1:28303".parse().unwrap();
    common::start_programmable_backend(addr, |_| async move {
        let events = [
            json!({"choices": [{"delta": {"content": "Hel"}}]}),
            json!({"choices": [{"delta": {"content": "lo"}, "finish_reason": "stop"}]}),
        ];
        let mut body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
        body.push_str("data: [DONE]\n\n");
        (200, "text/event-stream", body)
    })
    .await;

    let provider = OpenAiProvider::new(&config("mock", addr)).unwrap();
    let chunks: Vec<_> = provider
        .stream(&CompletionRequest::prompt("hi"))
        .await
        .unwrap()
        .collect()
        .await;

    let text: String = chunks.iter().map(|c| c.as_ref().unwrap().delta.clone()).collect();
    assert_eq!(text, "Hello");
    assert_eq!(
        chunks.last().unwrap().as_ref().unwrap().finish_reason.as_deref(),
        Some("stop")
    );
}

#[tokio::test]
async fn test_orchestrator_fails_over_between_http_providers() {
    let down: SocketAddr = "127.0.0.1:28304".parse().unwrap();
    let up: SocketAddr = "127.0.0.1:28305".parse().unwrap();
    common::start_programmable_backend(down, |_| async move {
        (503, "application/json", r#"{"error":"unavailable"}"#.to_string())
    })
    .await;
    common::start_programmable_backend(up, |_| async move { (200, "application/json", completion_body("served")) })
        .await;

    let health = HealthCheckConfig {
        enabled: false,
        ..HealthCheckConfig::default()
    };
    let orchestrator = Orchestrator::new(StrategyKind::RoundRobin, CircuitBreakerConfig::default(), health);
    orchestrator.register_provider(config("down", down)).unwrap();
    orchestrator.register_provider(config("up", up)).unwrap();

    let response = orchestrator.complete(CompletionRequest::prompt("hi")).await.unwrap();
    assert_eq!(response.provider_id, "up");
    assert_eq!(response.content, "served");

    let health = orchestrator.provider_health();
    assert_eq!(health[0].metrics.failed_requests, 1);
    assert_eq!(health[1].metrics.completion_tokens, 3);
}
