//! OpenAI-compatible chat completions provider.
//!
//! Speaks `POST {base_url}/chat/completions`, streaming over SSE `data:`
//! lines terminated by `[DONE]`. Works against any server implementing the
//! same surface (hosted APIs, local inference servers).

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::{OrchestratorError, Result};
use crate::providers::types::{
    ChunkStream, CompletionRequest, CompletionResponse, StreamChunk, TokenUsage,
};
use crate::providers::CompletionProvider;
use crate::transport::sse::SseParser;

/// Used when a 429 carries no usable `retry-after`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Bound on the `/models` probe.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<MessageBody>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageBody {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: MessageBody,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<Usage> for TokenUsage {
    fn from(u: Usage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }
    }
}

pub struct OpenAiProvider {
    id: String,
    base_url: String,
    model: String,
    max_tokens: Option<u32>,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
                OrchestratorError::Authentication {
                    backend: config.id.clone(),
                    reason: "api key contains characters not allowed in a header".into(),
                }
            })?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        for (name, value) in &config.headers {
            match (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                (Ok(header), Ok(value)) => {
                    headers.insert(header, value);
                }
                _ => tracing::warn!(provider = %config.id, header = %name, "Skipping invalid header"),
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| OrchestratorError::Connection {
                backend: config.id.clone(),
                reason: format!("failed to build http client: {e}"),
            })?;

        Ok(Self {
            id: config.id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout: config.timeout(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = Map::new();
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());
        body.insert("model".into(), json!(model));
        body.insert("messages".into(), json!(request.messages));
        body.insert("stream".into(), json!(stream));
        if stream {
            body.insert("stream_options".into(), json!({ "include_usage": true }));
        }
        if let Some(max_tokens) = request.max_tokens.or(self.max_tokens) {
            body.insert("max_tokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        if !request.stop.is_empty() {
            body.insert("stop".into(), json!(request.stop));
        }
        Value::Object(body)
    }

    async fn post(&self, body: &Value, timeout: Option<Duration>) -> Result<reqwest::Response> {
        let mut builder = self.client.post(self.url("chat/completions")).json(body);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        self.check_status(response).await
    }

    fn transport_error(&self, e: reqwest::Error) -> OrchestratorError {
        if e.is_timeout() {
            OrchestratorError::Timeout {
                backend: self.id.clone(),
                after: self.timeout,
            }
        } else {
            OrchestratorError::Connection {
                backend: self.id.clone(),
                reason: e.to_string(),
            }
        }
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        Err(match status.as_u16() {
            401 | 403 => OrchestratorError::Authentication {
                backend: self.id.clone(),
                reason: format!("http {status}: {body}"),
            },
            429 => OrchestratorError::RateLimited {
                backend: self.id.clone(),
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            },
            _ => OrchestratorError::Backend {
                backend: self.id.clone(),
                message: format!("http {status}: {body}"),
            },
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let response = self.post(&self.body(request, false), Some(self.timeout)).await?;
        let completion: ChatCompletion = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(e)
            } else {
                OrchestratorError::Protocol {
                    backend: self.id.clone(),
                    reason: format!("malformed completion: {e}"),
                }
            }
        })?;
        parse_completion(&self.id, &self.model, completion)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream> {
        // No whole-request deadline: a stream may legitimately outlive it.
        let response = self.post(&self.body(request, true), None).await?;
        Ok(chunk_stream(self.id.clone(), response.bytes_stream()))
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("models"))
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check_status(response).await.map(|_| ())
    }
}

fn parse_completion(provider: &str, default_model: &str, completion: ChatCompletion) -> Result<CompletionResponse> {
    let ChatCompletion {
        id,
        model,
        choices,
        usage,
    } = completion;
    let choice = choices.into_iter().next().ok_or_else(|| OrchestratorError::Protocol {
        backend: provider.to_string(),
        reason: "completion has no choices".into(),
    })?;

    Ok(CompletionResponse {
        id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        provider_id: provider.to_string(),
        model: model.unwrap_or_else(|| default_model.to_string()),
        content: choice.message.and_then(|m| m.content).unwrap_or_default(),
        finish_reason: choice.finish_reason,
        usage: usage.map(TokenUsage::from),
    })
}

struct StreamState<S> {
    provider: String,
    bytes: Pin<Box<S>>,
    parser: SseParser,
    queued: VecDeque<Result<StreamChunk>>,
    finished: bool,
}

impl<S> StreamState<S> {
    fn accept(&mut self, data: &str) {
        let data = data.trim();
        if self.finished || data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.finished = true;
            return;
        }
        match serde_json::from_str::<ChatCompletionChunk>(data) {
            Ok(chunk) => {
                let choice = chunk.choices.into_iter().next();
                let (delta, finish_reason) = match choice {
                    Some(c) => (c.delta.content.unwrap_or_default(), c.finish_reason),
                    None => (String::new(), None),
                };
                let usage = chunk.usage.map(TokenUsage::from);
                if delta.is_empty() && finish_reason.is_none() && usage.is_none() {
                    return;
                }
                self.queued.push_back(Ok(StreamChunk {
                    delta,
                    finish_reason,
                    usage,
                }));
            }
            Err(e) => {
                self.finished = true;
                self.queued.push_back(Err(OrchestratorError::Protocol {
                    backend: self.provider.clone(),
                    reason: format!("malformed stream chunk: {e}"),
                }));
            }
        }
    }
}

/// Turn an SSE byte stream into completion chunks.
fn chunk_stream<S, B>(provider: String, bytes: S) -> ChunkStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    let state = StreamState {
        provider,
        bytes: Box::pin(bytes),
        parser: SseParser::new(),
        queued: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queued.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    for event in state.parser.push(bytes.as_ref()) {
                        state.accept(&event.data);
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    let err = OrchestratorError::ConnectionClosed {
                        backend: state.provider.clone(),
                        reason: format!("stream read error: {e}"),
                    };
                    return Some((Err(err), state));
                }
                None => state.finished = true,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::providers::ChatMessage;

    fn provider() -> OpenAiProvider {
        let mut config = ProviderConfig::new("openai", ProviderKind::OpenAiCompatible);
        config.base_url = "http://localhost:1/v1/".into();
        config.model = "gpt-test".into();
        config.max_tokens = Some(256);
        OpenAiProvider::new(&config).unwrap()
    }

    #[test]
    fn test_request_body_uses_defaults() {
        let p = provider();
        let body = p.body(&CompletionRequest::new(vec![ChatMessage::user("hi")]), false);
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("temperature").is_none());
        assert_eq!(p.url("chat/completions"), "http://localhost:1/v1/chat/completions");
    }

    #[test]
    fn test_parse_completion() {
        let completion: ChatCompletion = serde_json::from_value(json!({
            "id": "cmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }))
        .unwrap();
        let response = parse_completion("openai", "gpt-test", completion).unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.model, "gpt-test");
        assert_eq!(response.usage.unwrap().total(), 4);

        let empty: ChatCompletion = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            parse_completion("openai", "m", empty),
            Err(OrchestratorError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_chunk_stream_stops_at_done() {
        let body: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choi".to_vec()),
            Ok(b"ces\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n".to_vec()),
            Ok(b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":2}}\n\n".to_vec()),
            Ok(b"data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n".to_vec()),
        ];
        let chunks: Vec<_> = chunk_stream("openai".into(), stream::iter(body)).collect().await;

        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].delta, "Hel");
        assert_eq!(chunks[1].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunks[2].usage.unwrap().completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_chunk_stream_reports_malformed_chunk() {
        let body: Vec<reqwest::Result<Vec<u8>>> = vec![Ok(b"data: {not json}\n\n".to_vec())];
        let mut chunks = chunk_stream("openai".into(), stream::iter(body));
        assert!(matches!(
            chunks.next().await,
            Some(Err(OrchestratorError::Protocol { .. }))
        ));
        assert!(chunks.next().await.is_none());
    }
}
