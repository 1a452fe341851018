//! Backend health classification.
//!
//! # Classes
//! - Healthy: error rate <= 10% and average latency <= 5s
//! - Degraded: error rate > 10% or average latency > 5s
//! - Unhealthy: error rate > 50% or average latency > 30s
//!
//! # Design Decisions
//! - Derived from rolling metrics; nothing is stored
//! - A backend that has never been called is healthy (optimistic initial trust)

use serde::Serialize;
use std::time::Duration;

use crate::state::BackendMetrics;

const UNHEALTHY_ERROR_RATE: f64 = 0.5;
const DEGRADED_ERROR_RATE: f64 = 0.1;
const UNHEALTHY_LATENCY: Duration = Duration::from_secs(30);
const DEGRADED_LATENCY: Duration = Duration::from_secs(5);

/// Latency at which the health score's latency term bottoms out.
const SCORE_LATENCY_CEILING: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_gauge(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::Unhealthy => 0.0,
        }
    }
}

/// Classify a backend from its metrics.
pub fn classify(metrics: &BackendMetrics) -> HealthStatus {
    if metrics.total_requests == 0 {
        return HealthStatus::Healthy;
    }
    let error_rate = metrics.error_rate();
    let latency = metrics.average_latency();
    if error_rate > UNHEALTHY_ERROR_RATE || latency > UNHEALTHY_LATENCY {
        HealthStatus::Unhealthy
    } else if error_rate > DEGRADED_ERROR_RATE || latency > DEGRADED_LATENCY {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Score used by the health-based strategy: higher is better.
///
/// `0.7 * success_rate + 0.3 * (1 - min(1, avg_latency / 10s))`
pub fn health_score(metrics: &BackendMetrics) -> f64 {
    let latency_ratio =
        (metrics.average_latency().as_secs_f64() / SCORE_LATENCY_CEILING.as_secs_f64()).min(1.0);
    0.7 * metrics.success_rate() + 0.3 * (1.0 - latency_ratio)
}

/// Aggregate health of a pool: unhealthy when nothing is usable.
pub fn aggregate<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
    let mut any = false;
    let mut all_healthy = true;
    let mut any_usable = false;
    for status in statuses {
        any = true;
        all_healthy &= status == HealthStatus::Healthy;
        any_usable |= status != HealthStatus::Unhealthy;
    }
    if !any || !any_usable {
        HealthStatus::Unhealthy
    } else if all_healthy {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(success: u32, failure: u32, latency_ms: u64) -> BackendMetrics {
        let mut m = BackendMetrics::default();
        for _ in 0..success {
            m.record_success(Duration::from_millis(latency_ms));
        }
        for _ in 0..failure {
            m.record_failure(Duration::from_millis(latency_ms));
        }
        m
    }

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(classify(&BackendMetrics::default()), HealthStatus::Healthy);
        assert_eq!(classify(&metrics(95, 5, 100)), HealthStatus::Healthy);
        assert_eq!(classify(&metrics(8, 2, 100)), HealthStatus::Degraded);
        assert_eq!(classify(&metrics(10, 0, 6_000)), HealthStatus::Degraded);
        assert_eq!(classify(&metrics(4, 6, 100)), HealthStatus::Unhealthy);
        assert_eq!(classify(&metrics(10, 0, 31_000)), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_score() {
        let fresh = health_score(&BackendMetrics::default());
        assert!((fresh - 1.0).abs() < 1e-9);

        let slow = health_score(&metrics(10, 0, 20_000));
        assert!((slow - 0.7).abs() < 1e-9);

        let flaky = health_score(&metrics(5, 5, 0));
        assert!((flaky - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate() {
        use HealthStatus::*;
        assert_eq!(aggregate([]), Unhealthy);
        assert_eq!(aggregate([Healthy, Healthy]), Healthy);
        assert_eq!(aggregate([Healthy, Unhealthy]), Degraded);
        assert_eq!(aggregate([Unhealthy, Unhealthy]), Unhealthy);
    }
}
