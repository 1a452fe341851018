//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → OrchestratorConfig (validated, immutable)
//!     → providers and tool servers registered from it
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → changed backends are re-registered
//! ```
//!
//! # Design Decisions
//! - Backend configs are immutable once registered; changes re-register
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    CacheConfig, CapabilityFlags, CircuitBreakerConfig, HealthCheckConfig, ObservabilityConfig,
    OrchestratorConfig, ProviderConfig, ProviderKind, RateLimitConfig, StrategyKind,
    ToolServerConfig, TransportKind,
};
