//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check connection parameters match the transport kind
//! - Validate value ranges (timeouts > 0, finite weights)
//! - Detect duplicate backend ids
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function of the config
//! - Runs before a backend is accepted into a registry

use std::collections::HashSet;
use url::Url;

use crate::config::schema::{
    OrchestratorConfig, ProviderConfig, ProviderKind, RateLimitConfig, ToolServerConfig,
    TransportKind,
};

/// A single semantic violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a whole configuration file.
pub fn validate_config(config: &OrchestratorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for (i, provider) in config.providers.iter().enumerate() {
        if !seen.insert(provider.id.as_str()) {
            errors.push(ValidationError::new(
                format!("providers[{i}].id"),
                format!("duplicate provider id '{}'", provider.id),
            ));
        }
        check_provider(provider, &format!("providers[{i}]"), &mut errors);
    }

    let mut seen = HashSet::new();
    for (i, server) in config.tool_servers.iter().enumerate() {
        if !seen.insert(server.id.as_str()) {
            errors.push(ValidationError::new(
                format!("tool_servers[{i}].id"),
                format!("duplicate tool server id '{}'", server.id),
            ));
        }
        check_tool_server(server, &format!("tool_servers[{i}]"), &mut errors);
    }

    if config.circuit_breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be at least 1"));
    }
    if config.health_check.enabled && config.health_check.interval_secs == 0 {
        errors.push(ValidationError::new("health_check.interval_secs", "must be greater than 0"));
    }
    if config.cache.max_entries == 0 {
        errors.push(ValidationError::new("cache.max_entries", "must be greater than 0"));
    }

    into_result(errors)
}

/// Validate one provider before registration.
pub fn validate_provider(config: &ProviderConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_provider(config, "provider", &mut errors);
    into_result(errors)
}

/// Validate one tool server before registration.
pub fn validate_tool_server(config: &ToolServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_tool_server(config, "tool_server", &mut errors);
    into_result(errors)
}

fn into_result(errors: Vec<ValidationError>) -> Result<(), Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_provider(config: &ProviderConfig, path: &str, errors: &mut Vec<ValidationError>) {
    check_id(&config.id, path, errors);

    if config.kind == ProviderKind::OpenAiCompatible {
        check_url(&config.base_url, &["http", "https"], &format!("{path}.base_url"), errors);
        if config.model.trim().is_empty() {
            errors.push(ValidationError::new(format!("{path}.model"), "must not be empty"));
        }
    }
    if config.timeout_secs == 0 {
        errors.push(ValidationError::new(format!("{path}.timeout_secs"), "must be greater than 0"));
    }
    if !config.cost_weight.is_finite() || config.cost_weight < 0.0 {
        errors.push(ValidationError::new(
            format!("{path}.cost_weight"),
            "must be a finite, non-negative number",
        ));
    }
    for (field, price) in [
        ("input_cost_per_1k", config.input_cost_per_1k),
        ("output_cost_per_1k", config.output_cost_per_1k),
    ] {
        if !price.is_finite() || price < 0.0 {
            errors.push(ValidationError::new(
                format!("{path}.{field}"),
                "must be a finite, non-negative number",
            ));
        }
    }
    check_rate_limit(&config.rate_limit, path, errors);
}

fn check_tool_server(config: &ToolServerConfig, path: &str, errors: &mut Vec<ValidationError>) {
    check_id(&config.id, path, errors);

    match config.transport {
        TransportKind::Stdio => {
            let missing = config.command.as_deref().map(str::trim).unwrap_or("").is_empty();
            if missing {
                errors.push(ValidationError::new(
                    format!("{path}.command"),
                    "is required for the stdio transport",
                ));
            }
        }
        kind => {
            let schemes: &[&str] = if kind == TransportKind::Websocket {
                &["ws", "wss"]
            } else {
                &["http", "https"]
            };
            match &config.url {
                Some(url) => check_url(url, schemes, &format!("{path}.url"), errors),
                None => errors.push(ValidationError::new(
                    format!("{path}.url"),
                    format!("is required for the {kind} transport"),
                )),
            }
        }
    }

    if config.timeout_secs == 0 {
        errors.push(ValidationError::new(format!("{path}.timeout_secs"), "must be greater than 0"));
    }
    check_rate_limit(&config.rate_limit, path, errors);
}

fn check_id(id: &str, path: &str, errors: &mut Vec<ValidationError>) {
    if id.trim().is_empty() {
        errors.push(ValidationError::new(format!("{path}.id"), "must not be empty"));
    } else if id.chars().any(char::is_whitespace) {
        errors.push(ValidationError::new(format!("{path}.id"), "must not contain whitespace"));
    }
}

fn check_url(raw: &str, schemes: &[&str], field: &str, errors: &mut Vec<ValidationError>) {
    match Url::parse(raw) {
        Ok(url) if schemes.contains(&url.scheme()) => {}
        Ok(url) => errors.push(ValidationError::new(
            field,
            format!("scheme '{}' not allowed (expected {})", url.scheme(), schemes.join(" or ")),
        )),
        Err(e) => errors.push(ValidationError::new(field, format!("invalid URL '{raw}': {e}"))),
    }
}

fn check_rate_limit(limit: &RateLimitConfig, path: &str, errors: &mut Vec<ValidationError>) {
    if limit.requests_per_minute == Some(0) {
        errors.push(ValidationError::new(
            format!("{path}.rate_limit.requests_per_minute"),
            "must be greater than 0 when set",
        ));
    }
    if limit.requests_per_hour == Some(0) {
        errors.push(ValidationError::new(
            format!("{path}.rate_limit.requests_per_hour"),
            "must be greater than 0 when set",
        ));
    }
}
