//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every backend of a subsystem
//! - Let the subsystem update backend state from the results

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;

/// A subsystem whose backends can be probed.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Probe every backend once and apply the results.
    async fn probe_all(&self);
}

/// Periodic driver for a [`HealthProbe`].
pub struct HealthMonitor<P> {
    probe: P,
    interval: Duration,
}

impl<P: HealthProbe> HealthMonitor<P> {
    pub fn new(probe: P, interval: Duration) -> Self {
        Self { probe, interval }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            subsystem = self.probe.name(),
            interval = ?self.interval,
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately; backends were just connected.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe.probe_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!(subsystem = self.probe.name(), "Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
