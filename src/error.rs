//! Error taxonomy shared by every subsystem.
//!
//! # Propagation
//! - Local guard failures (`RateLimited`, `CircuitOpen`) are resolved by
//!   trying the next candidate and only surface inside `AllBackendsFailed`.
//! - Caller-input errors (`Config`, `ToolNotFound`, `Validation`) are never
//!   retried.
//! - `Authentication` is never retried automatically.

use std::time::Duration;
use thiserror::Error;

use crate::config::validation::ValidationError;

/// Result alias used across the crate.
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Errors produced by the orchestrator, the tool-server manager and their transports.
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    /// Registration-time invalid configuration.
    #[error("invalid configuration: {}", join_violations(.0))]
    Config(Vec<ValidationError>),

    /// Transport connect or handshake failure.
    #[error("connection to '{backend}' failed: {reason}")]
    Connection { backend: String, reason: String },

    /// The connection closed while a call was outstanding.
    #[error("connection to '{backend}' closed: {reason}")]
    ConnectionClosed { backend: String, reason: String },

    /// Local rate limit tripped before any network call was made.
    #[error("backend '{backend}' rate limited, retry after {retry_after:?}")]
    RateLimited { backend: String, retry_after: Duration },

    /// Local circuit breaker is open for this backend.
    #[error("circuit open for backend '{backend}'")]
    CircuitOpen { backend: String },

    /// A call exceeded its deadline.
    #[error("call to '{backend}' timed out after {after:?}")]
    Timeout { backend: String, after: Duration },

    /// Credentials rejected by the backend.
    #[error("authentication rejected by '{backend}': {reason}")]
    Authentication { backend: String, reason: String },

    /// The backend answered with an error.
    #[error("backend '{backend}' returned an error: {message}")]
    Backend { backend: String, message: String },

    /// The backend answered with something that could not be understood.
    #[error("protocol error from '{backend}': {reason}")]
    Protocol { backend: String, reason: String },

    /// Requested tool is not exposed by the server.
    #[error("tool '{tool}' not found on server '{server}'")]
    ToolNotFound { server: String, tool: String },

    /// Tool parameters failed validation.
    #[error("invalid parameters for '{tool}': missing {}", .missing.join(", "))]
    Validation { tool: String, missing: Vec<String> },

    /// The execution was cancelled by the caller.
    #[error("execution {request_id} cancelled")]
    Cancelled { request_id: String },

    /// No backend registered under this id.
    #[error("backend '{backend}' is not registered")]
    NotFound { backend: String },

    /// The registry is empty.
    #[error("no backends registered")]
    NoBackends,

    /// Every candidate was tried and failed.
    #[error("all backends failed, last error: {last_error}")]
    AllBackendsFailed { last_error: Box<OrchestratorError> },
}

impl OrchestratorError {
    /// Short machine-readable label, used for metrics and error logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connection { .. } => "connection",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "timeout",
            Self::Authentication { .. } => "authentication",
            Self::Backend { .. } => "backend",
            Self::Protocol { .. } => "protocol",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::Validation { .. } => "validation",
            Self::Cancelled { .. } => "cancelled",
            Self::NotFound { .. } => "not_found",
            Self::NoBackends => "no_backends",
            Self::AllBackendsFailed { .. } => "all_backends_failed",
        }
    }

    /// Whether a retry against the same backend may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed { .. }
                | Self::Timeout { .. }
                | Self::Backend { .. }
                | Self::Protocol { .. }
        )
    }

    /// Failures raised by the local resilience guard before any network call.
    pub fn is_local_guard(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::CircuitOpen { .. })
    }

    /// Errors caused by the caller's input; surfaced immediately, never failed over.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::ToolNotFound { .. } | Self::Validation { .. } | Self::Cancelled { .. }
        )
    }
}

fn join_violations(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
