//! Health-based selection strategy.

use std::sync::Arc;

use crate::config::StrategyKind;
use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Best health score first; see [`crate::health::health_score`].
#[derive(Debug, Default)]
pub struct HealthBased;

impl HealthBased {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for HealthBased {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HealthBased
    }

    fn order(&self, backends: Vec<Arc<Backend>>) -> Vec<Arc<Backend>> {
        // Score once; the metrics lock is taken per backend.
        let mut scored: Vec<(f64, Arc<Backend>)> =
            backends.into_iter().map(|b| (b.health_score(), b)).collect();
        scored.sort_by(|(a, _), (b, _)| b.total_cmp(a));
        scored.into_iter().map(|(_, b)| b).collect()
    }
}
