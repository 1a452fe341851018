//! Per-backend sliding-window rate limiting.
//!
//! Keeps the instants of recorded attempts for the last hour and checks them
//! against a per-minute and a per-hour budget.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Sliding-window limiter over recorded attempts.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    per_minute: Option<u32>,
    per_hour: Option<u32>,
    attempts: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            per_minute: config.requests_per_minute,
            per_hour: config.requests_per_hour,
            attempts: VecDeque::new(),
        }
    }

    /// Check the budget at `now`. On rejection returns how long to wait.
    pub fn check(&mut self, now: Instant) -> Result<(), Duration> {
        self.prune(now);

        if let Some(limit) = self.per_minute {
            if let Some(wait) = self.wait_for(now, MINUTE, limit) {
                return Err(wait);
            }
        }
        if let Some(limit) = self.per_hour {
            if let Some(wait) = self.wait_for(now, HOUR, limit) {
                return Err(wait);
            }
        }
        Ok(())
    }

    /// Record an attempt made at `now`.
    pub fn record(&mut self, now: Instant) {
        if self.per_minute.is_none() && self.per_hour.is_none() {
            return;
        }
        self.attempts.push_back(now);
        self.prune(now);
    }

    pub fn recorded(&self) -> usize {
        self.attempts.len()
    }

    fn wait_for(&self, now: Instant, window: Duration, limit: u32) -> Option<Duration> {
        let in_window: Vec<&Instant> = self
            .attempts
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < window)
            .collect();
        if in_window.len() < limit as usize {
            return None;
        }
        // The window frees a slot once the oldest counted attempt ages out.
        let oldest = in_window[in_window.len() - limit as usize];
        Some(window.saturating_sub(now.saturating_duration_since(*oldest)))
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.attempts.front() {
            if now.saturating_duration_since(*front) >= HOUR {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: Option<u32>, per_hour: Option<u32>) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(&RateLimitConfig {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
        })
    }

    #[test]
    fn test_unlimited_by_default() {
        let mut l = limiter(None, None);
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(l.check(now).is_ok());
            l.record(now);
        }
        assert_eq!(l.recorded(), 0);
    }

    #[test]
    fn test_per_minute_budget() {
        let mut l = limiter(Some(2), None);
        let start = Instant::now();
        l.record(start);
        l.record(start + Duration::from_secs(10));
        let wait = l.check(start + Duration::from_secs(20)).unwrap_err();
        assert_eq!(wait, Duration::from_secs(40));

        // Oldest attempt slides out of the window.
        assert!(l.check(start + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn test_per_hour_budget() {
        let mut l = limiter(Some(100), Some(3));
        let start = Instant::now();
        for i in 0..3 {
            l.record(start + Duration::from_secs(i * 120));
        }
        assert!(l.check(start + Duration::from_secs(400)).is_err());
        assert!(l.check(start + Duration::from_secs(3601)).is_ok());
    }
}
