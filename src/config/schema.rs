//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the orchestrator.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Completion provider definitions.
    pub providers: Vec<ProviderConfig>,

    /// Tool server definitions.
    pub tool_servers: Vec<ToolServerConfig>,

    /// Provider selection strategy.
    pub strategy: StrategyKind,

    /// Circuit breaker tunables, applied to every backend.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Resource cache bounds.
    pub cache: CacheConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Provider selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    LeastConnections,
    Weighted,
    CostOptimized,
    #[default]
    HealthBased,
}

/// Kind of completion provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Any endpoint speaking the OpenAI chat completions API.
    #[default]
    #[serde(alias = "openai")]
    OpenAiCompatible,
    /// Implementation supplied in code via `Orchestrator::register_provider_with`.
    Custom,
}

/// Completion provider configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Unique provider identifier.
    pub id: String,

    #[serde(default)]
    pub kind: ProviderKind,

    /// Base URL of the API (e.g., "https://api.openai.com/v1").
    #[serde(default)]
    pub base_url: String,

    /// API key sent as a bearer token.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model requested when the caller does not name one.
    #[serde(default)]
    pub model: String,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries against this provider before failing over.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Relative cost used by the weighted and cost-optimized strategies.
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,

    /// Price per 1000 prompt tokens.
    #[serde(default)]
    pub input_cost_per_1k: f64,

    /// Price per 1000 completion tokens.
    #[serde(default)]
    pub output_cost_per_1k: f64,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Whether the provider can stream.
    #[serde(default = "default_true")]
    pub streaming: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProviderConfig {
    /// Minimal configuration for a provider with the given id.
    pub fn new(id: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            id: id.into(),
            kind,
            base_url: String::new(),
            api_key: None,
            model: String::new(),
            headers: HashMap::new(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            rate_limit: RateLimitConfig::default(),
            cost_weight: default_cost_weight(),
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
            max_tokens: None,
            streaming: true,
            enabled: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Cost of one request given its token usage.
    pub fn cost_of(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.input_cost_per_1k
            + completion_tokens as f64 / 1000.0 * self.output_cost_per_1k
    }
}

/// Wire transport used to reach a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Spawned subprocess speaking over stdin/stdout.
    Stdio,
    /// Server-push event stream with requests posted over HTTP.
    #[serde(alias = "stream")]
    Sse,
    /// Bidirectional socket.
    #[serde(alias = "socket")]
    Websocket,
    /// Plain request/response HTTP.
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::Websocket => "websocket",
            Self::Http => "http",
        };
        f.write_str(s)
    }
}

/// Which capability lists to discover after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CapabilityFlags {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
        }
    }
}

/// Tool server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolServerConfig {
    /// Unique server identifier.
    pub id: String,

    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,

    pub transport: TransportKind,

    /// Executable for stdio servers.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub cwd: Option<String>,

    /// Endpoint for network transports.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Default tool call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Consecutive reconnect attempts before giving up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base reconnect delay in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub capabilities: CapabilityFlags,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl ToolServerConfig {
    /// Configuration for a stdio server.
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        let mut config = Self::base(id.into(), TransportKind::Stdio);
        config.command = Some(command.into());
        config.args = args;
        config
    }

    /// Configuration for a network server.
    pub fn remote(id: impl Into<String>, transport: TransportKind, url: impl Into<String>) -> Self {
        let mut config = Self::base(id.into(), transport);
        config.url = Some(url.into());
        config
    }

    fn base(id: String, transport: TransportKind) -> Self {
        Self {
            id,
            name: None,
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            auto_reconnect: true,
            enabled: true,
            capabilities: CapabilityFlags::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Per-backend request budget. Unset limits are unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Window in which the failures must occur, in milliseconds.
    pub monitoring_window_ms: u64,

    /// Time the circuit stays open before a probe is allowed, in milliseconds.
    pub reset_timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            monitoring_window_ms: 5 * 60 * 1000,
            reset_timeout_ms: 60 * 1000,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable periodic health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Timeout for a single probe in seconds.
    pub timeout_secs: u64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            timeout_secs: 10,
        }
    }
}

/// Resource cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries held before the cache is cleared.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 100 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log format ("pretty" or "json").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_cost_weight() -> f64 {
    1.0
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}
