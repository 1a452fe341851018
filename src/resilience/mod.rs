//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to backend:
//!     → guard.rs (rate limit check, circuit state check)
//!     → timeouts.rs (enforce per-call deadline)
//!     → On failure: retries.rs (check if retryable, retry with backoff.rs)
//!     → guard.rs (record outcome; open circuit if threshold exceeded)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Guard failures are local and make the caller try another backend
//! - Circuit breaker prevents cascading failures
//! - Breaker and limiter are per backend, never shared

pub mod backoff;
pub mod circuit_breaker;
pub mod guard;
pub mod rate_limit;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::CircuitState;
pub use guard::{CallPermit, Resilience};
pub use retries::with_retry;
pub use timeouts::with_timeout;
