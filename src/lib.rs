//! Resilient orchestration of completion providers and tool servers.

pub mod config;
pub mod error;
pub mod state;

pub mod load_balancer;
pub mod orchestrator;
pub mod providers;

pub mod tool_server;
pub mod transport;

pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use lifecycle::Shutdown;
pub use orchestrator::Orchestrator;
pub use tool_server::ToolServerManager;
