//! Least Connections selection strategy.

use std::sync::Arc;

use crate::config::StrategyKind;
use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Fewest in-flight requests first. Ties keep registration order.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LeastConnections
    }

    fn order(&self, mut backends: Vec<Arc<Backend>>) -> Vec<Arc<Backend>> {
        backends.sort_by_key(|b| b.active_requests());
        backends
    }
}
