//! Provider selection subsystem.
//!
//! # Data Flow
//! ```text
//! Orchestrator::complete
//!     → pool.rs (healthy backends; the full registry when none is healthy)
//!     → Apply the active strategy to order the candidates:
//!         - round_robin.rs (rotate the starting backend)
//!         - least_conn.rs (fewest in-flight requests first)
//!         - weighted.rs (cheapest cost weight first)
//!         - health_based.rs (best health score first)
//!     → Orchestrator tries candidates strictly in that order
//! ```
//!
//! # Design Decisions
//! - Strategies order, they never filter; filtering is the pool's job
//! - Sorting is stable, so ties keep registration order
//! - The strategy can be swapped at runtime

pub mod backend;
pub mod health_based;
pub mod least_conn;
pub mod pool;
pub mod round_robin;
pub mod weighted;

use std::sync::Arc;

use crate::config::StrategyKind;
use backend::Backend;

pub use backend::InFlightGuard;
pub use pool::BackendPool;

/// A candidate ordering policy.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> StrategyKind;

    /// Order `backends` by preference, most preferred first.
    fn order(&self, backends: Vec<Arc<Backend>>) -> Vec<Arc<Backend>>;
}

/// Instantiate the strategy for `kind`.
pub fn strategy_for(kind: StrategyKind) -> Arc<dyn LoadBalancer> {
    match kind {
        StrategyKind::RoundRobin => Arc::new(round_robin::RoundRobin::new()),
        StrategyKind::LeastConnections => Arc::new(least_conn::LeastConnections::new()),
        StrategyKind::Weighted | StrategyKind::CostOptimized => Arc::new(weighted::CostWeighted::new(kind)),
        StrategyKind::HealthBased => Arc::new(health_based::HealthBased::new()),
    }
}
