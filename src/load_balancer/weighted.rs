//! Cost-weighted selection strategy.

use std::sync::Arc;

use crate::config::StrategyKind;
use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Ascending cost weight. Serves both `weighted` and `cost_optimized`.
#[derive(Debug)]
pub struct CostWeighted {
    kind: StrategyKind,
}

impl CostWeighted {
    pub fn new(kind: StrategyKind) -> Self {
        Self { kind }
    }
}

impl LoadBalancer for CostWeighted {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn order(&self, mut backends: Vec<Arc<Backend>>) -> Vec<Arc<Backend>> {
        backends.sort_by(|a, b| a.config.cost_weight.total_cmp(&b.config.cost_weight));
        backends
    }
}
