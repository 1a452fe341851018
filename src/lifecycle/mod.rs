//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → Stop health monitors and reconnect loops
//!     → Disconnect tool servers → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Trigger config reload
//!
//! Reload (reload.rs):
//!     New config → diff against the running one
//!     → re-register changed providers and tool servers, drop removed ones
//! ```

pub mod reload;
pub mod shutdown;
pub mod signals;

pub use reload::{apply_reload, ReloadSummary};
pub use shutdown::Shutdown;
pub use signals::SignalAction;
