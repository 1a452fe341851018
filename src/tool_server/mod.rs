//! Tool-server manager.
//!
//! # Data Flow
//! ```text
//! add_server(config)
//!     → create_transport (stdio / sse / websocket / http)
//!     → connect → initialize handshake → discovery (tools, resources, prompts)
//!     → connected
//!
//! execute_tool(server, tool, params)
//!     → status, tool and parameter checks (no transport call on failure)
//!     → Resilience::before_call
//!     → tools/call raced against timeout and cancellation
//!
//! Transport events
//!     → progress: update execution, emit ExecutionProgress
//!     → list_changed: rediscover
//!     → closed / failed ping: error → reconnect with backoff
//! ```
//!
//! # Design Decisions
//! - One manager for every transport kind
//! - Only connected servers contribute tools
//! - Reconnect delay doubles per attempt and is capped at 30s

pub mod cache;
pub mod discovery;
pub mod events;
mod manager;
pub mod state;
pub mod types;

pub use events::ManagerEvent;
pub use manager::ToolServerManager;
pub use state::{AggregateMetrics, ServerStatus};
pub use types::{
    ExecutionContext, ExecutionOptions, ExecutionResult, ExecutionStatus, Progress, Prompt, Resource,
    ServerCapabilities, ServerTool, Tool, ToolCallResult,
};
