//! Per-request bookkeeping.

use serde::Serialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::providers::TokenUsage;

/// One attempt against one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub backend: String,
    pub latency: Duration,
    pub usage: Option<TokenUsage>,
    pub cost: f64,
    pub error: Option<String>,
}

/// State of one logical request as failover proceeds.
#[derive(Debug)]
pub struct RequestContext {
    pub id: Uuid,
    /// Candidate currently being tried.
    pub backend: Option<String>,
    pub started: Instant,
    pub attempts: Vec<AttemptRecord>,
    success: Option<bool>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            backend: None,
            started: Instant::now(),
            attempts: Vec::new(),
            success: None,
        }
    }

    pub fn select(&mut self, backend: &str) {
        self.backend = Some(backend.to_string());
    }

    pub fn record_success(&mut self, latency: Duration, usage: Option<TokenUsage>, cost: f64) {
        self.push(latency, usage, cost, None);
    }

    pub fn record_failure(&mut self, latency: Duration, error: &str) {
        self.push(latency, None, 0.0, Some(error.to_string()));
    }

    fn push(&mut self, latency: Duration, usage: Option<TokenUsage>, cost: f64, error: Option<String>) {
        self.attempts.push(AttemptRecord {
            backend: self.backend.clone().unwrap_or_default(),
            latency,
            usage,
            cost,
            error,
        });
    }

    /// Set the terminal outcome. Only the first call has any effect.
    pub fn finish(&mut self, success: bool) -> bool {
        if self.success.is_some() {
            return false;
        }
        self.success = Some(success);
        true
    }

    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
