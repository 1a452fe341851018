//! Round-robin selection strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::StrategyKind;
use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Rotates the starting candidate on every call.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RoundRobin
    }

    fn order(&self, mut backends: Vec<Arc<Backend>>) -> Vec<Arc<Backend>> {
        if backends.is_empty() {
            return backends;
        }
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % backends.len();
        backends.rotate_left(start);
        backends
    }
}
