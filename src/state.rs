//! Runtime state shared by provider backends and tool servers.
//!
//! # Responsibilities
//! - Connection lifecycle status
//! - Rolling request metrics (counts, running average latency, tokens, cost)
//! - Bounded log of recent errors
//!
//! # Design Decisions
//! - State is owned by exactly one subsystem and guarded by a per-backend lock
//! - Metrics are cumulative since registration; no time decay

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// Maximum number of errors retained per backend.
pub const ERROR_LOG_CAPACITY: usize = 100;

/// Lifecycle status of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Error,
    Reconnecting,
}

impl ConnectionStatus {
    /// Connected or degraded: the backend accepts calls.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Rolling request metrics for one backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Running average latency over all recorded requests, in milliseconds.
    pub average_latency_ms: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_cost: f64,
    pub last_request_at: Option<SystemTime>,
}

impl BackendMetrics {
    pub fn record_success(&mut self, latency: Duration) {
        self.successful_requests += 1;
        self.record_latency(latency);
    }

    pub fn record_failure(&mut self, latency: Duration) {
        self.failed_requests += 1;
        self.record_latency(latency);
    }

    /// Add token usage and cost for a completed request.
    pub fn record_usage(&mut self, prompt_tokens: u64, completion_tokens: u64, cost: f64) {
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        self.total_cost += cost;
    }

    fn record_latency(&mut self, latency: Duration) {
        self.total_requests += 1;
        let n = self.total_requests as f64;
        let sample = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms += (sample - self.average_latency_ms) / n;
        self.last_request_at = Some(SystemTime::now());
    }

    /// Fraction of successful requests. Optimistic (1.0) before any request.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    pub fn error_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }

    pub fn average_latency(&self) -> Duration {
        Duration::from_secs_f64(self.average_latency_ms.max(0.0) / 1000.0)
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One recorded error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub at: SystemTime,
    pub kind: String,
    pub message: String,
}

/// Ring buffer of recent errors; the oldest entry is evicted first.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorLog {
    entries: VecDeque<ErrorRecord>,
    #[serde(skip)]
    capacity: usize,
}

impl ErrorLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(16)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, kind: impl Into<String>, message: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ErrorRecord {
            at: SystemTime::now(),
            kind: kind.into(),
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `n` most recent errors, newest last.
    pub fn recent(&self, n: usize) -> Vec<ErrorRecord> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<&ErrorRecord> {
        self.entries.back()
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::with_capacity(ERROR_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average_latency() {
        let mut m = BackendMetrics::default();
        m.record_success(Duration::from_millis(100));
        m.record_failure(Duration::from_millis(300));
        assert_eq!(m.total_requests, 2);
        assert!((m.average_latency_ms - 200.0).abs() < 1e-6);
        assert!((m.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_success_rate_is_optimistic_without_requests() {
        let m = BackendMetrics::default();
        assert_eq!(m.success_rate(), 1.0);
        assert_eq!(m.error_rate(), 0.0);
    }

    #[test]
    fn test_error_log_evicts_oldest() {
        let mut log = ErrorLog::default();
        for i in 0..(ERROR_LOG_CAPACITY + 5) {
            log.push("backend", format!("error {i}"));
        }
        assert_eq!(log.len(), ERROR_LOG_CAPACITY);
        let recent = log.recent(ERROR_LOG_CAPACITY);
        assert_eq!(recent[0].message, "error 5");
        assert_eq!(log.last().unwrap().message, format!("error {}", ERROR_LOG_CAPACITY + 4));
    }
}
