//! Completion providers.
//!
//! A provider turns a [`CompletionRequest`] into a response or a chunk
//! stream. Providers know nothing about failover, rate limits or circuit
//! breaking; the orchestrator wraps every call.

pub mod openai;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::validation::ValidationError;
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{OrchestratorError, Result};

pub use openai::OpenAiProvider;
pub use types::{
    ChatMessage, ChunkStream, CompletionRequest, CompletionResponse, Role, StreamChunk, TokenUsage,
};

/// A completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Start a streamed completion. Errors before the first chunk are
    /// returned here; later errors arrive on the stream.
    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream>;

    /// Cheap reachability probe used by the health monitor.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the provider implementation for a configuration.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn CompletionProvider>> {
    match config.kind {
        ProviderKind::OpenAiCompatible => Ok(Arc::new(OpenAiProvider::new(config)?)),
        ProviderKind::Custom => Err(OrchestratorError::Config(vec![ValidationError::new(
            "provider.kind",
            "custom providers must be registered with an implementation",
        )])),
    }
}
