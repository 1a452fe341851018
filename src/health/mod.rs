//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Passive health (state.rs):
//!     Call outcome recorded in backend metrics
//!     → classify() → Healthy / Degraded / Unhealthy
//!     → selection skips Unhealthy backends
//!
//! Active health checks (active.rs):
//!     Periodic timer
//!     → HealthProbe::probe_all on the orchestrator or tool-server manager
//!     → failed probes drive status changes and reconnects
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary
//! - Health state is per-backend, not per-pool
//! - Probes never count toward request metrics

pub mod active;
pub mod state;

pub use active::{HealthMonitor, HealthProbe};
pub use state::{aggregate, classify, health_score, HealthStatus};
