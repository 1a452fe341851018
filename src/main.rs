//! Orchestrator daemon.
//!
//! ```text
//! config file ──▶ Orchestrator (completion providers)
//!             └─▶ ToolServerManager (stdio / sse / websocket / http servers)
//!
//! health monitors ──▶ both subsystems, every `health_check.interval_secs`
//! file watcher, SIGHUP ──▶ apply_reload
//! Ctrl+C, SIGTERM ──▶ shutdown
//! ```

use std::path::PathBuf;
use std::time::Duration;

use backend_orchestrator::config::loader::load_config;
use backend_orchestrator::config::watcher::ConfigWatcher;
use backend_orchestrator::lifecycle::signals::next_signal;
use backend_orchestrator::lifecycle::{apply_reload, SignalAction};
use backend_orchestrator::observability::{logging, metrics};
use backend_orchestrator::{Orchestrator, ToolServerManager};

/// Fallback when no path argument is given.
const CONFIG_ENV: &str = "ORCHESTRATOR_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .ok_or_else(|| format!("usage: orchestrator <config.toml> (or set {CONFIG_ENV})"))?;

    let mut config = load_config(&path)?;
    logging::init_tracing(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        providers = config.providers.len(),
        tool_servers = config.tool_servers.len(),
        strategy = ?config.strategy,
        "orchestrator starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let orchestrator = Orchestrator::from_config(&config)?;
    let tools = ToolServerManager::from_config(&config).await;
    let connected = tools
        .get_server_status(None)?
        .iter()
        .filter(|s| s.status.is_available())
        .count();
    tracing::info!(
        providers = orchestrator.provider_ids().len(),
        tool_servers = tools.server_ids().len(),
        connected,
        tools = tools.get_all_tools().len(),
        "Backends registered"
    );

    orchestrator.start_health_checks();
    tools.start_health_checks();

    let (_watcher, mut updates) = match ConfigWatcher::spawn(&path) {
        Ok((watcher, updates)) => (Some(watcher), Some(updates)),
        Err(e) => {
            tracing::warn!(error = %e, "Config hot reload unavailable");
            (None, None)
        }
    };

    loop {
        tokio::select! {
            Some(next) = recv_update(&mut updates) => {
                apply_reload(&orchestrator, &tools, &config, &next).await;
                config = next;
            }
            signal = next_signal() => match signal {
                Ok(SignalAction::Reload) => match load_config(&path) {
                    Ok(next) => {
                        apply_reload(&orchestrator, &tools, &config, &next).await;
                        config = next;
                    }
                    Err(e) => tracing::error!(error = %e, "Reload on SIGHUP failed, keeping current config"),
                },
                Ok(SignalAction::Shutdown) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Signal handling failed");
                    break;
                }
            },
        }
    }

    tracing::info!("Shutdown signal received, stopping");
    orchestrator.shutdown();
    if tokio::time::timeout(Duration::from_secs(10), tools.shutdown()).await.is_err() {
        tracing::warn!("Tool servers did not disconnect in time");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn recv_update<T>(updates: &mut Option<tokio::sync::mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match updates {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
