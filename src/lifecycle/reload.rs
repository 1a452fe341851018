//! Applying a reloaded configuration to running subsystems.
//!
//! Backends whose configuration is unchanged keep their state (metrics,
//! circuit, connection). Changed ones are re-registered from scratch.

use std::collections::HashMap;

use crate::config::OrchestratorConfig;
use crate::orchestrator::Orchestrator;
use crate::tool_server::ToolServerManager;

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub strategy_changed: bool,
}

impl ReloadSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty() && !self.strategy_changed
    }
}

/// Diff `previous` against `next` and apply the difference.
///
/// Circuit breaker, health check and cache settings only take effect for
/// backends registered after the reload.
pub async fn apply_reload(
    orchestrator: &Orchestrator,
    tools: &ToolServerManager,
    previous: &OrchestratorConfig,
    next: &OrchestratorConfig,
) -> ReloadSummary {
    let mut summary = ReloadSummary::default();

    if previous.strategy != next.strategy {
        orchestrator.set_strategy(next.strategy);
        summary.strategy_changed = true;
    }

    let old_providers: HashMap<&str, _> = previous.providers.iter().map(|p| (p.id.as_str(), p)).collect();
    for provider in &next.providers {
        let changed = match old_providers.get(provider.id.as_str()) {
            Some(old) if *old == provider => continue,
            Some(_) => &mut summary.updated,
            None => &mut summary.added,
        };
        match orchestrator.register_provider(provider.clone()) {
            Ok(()) => changed.push(format!("provider:{}", provider.id)),
            Err(e) => tracing::error!(provider = %provider.id, error = %e, "Failed to apply provider change"),
        }
    }
    for provider in &previous.providers {
        let gone = !next.providers.iter().any(|p| p.id == provider.id);
        if gone && orchestrator.unregister_provider(&provider.id).is_ok() {
            summary.removed.push(format!("provider:{}", provider.id));
        }
    }

    let old_servers: HashMap<&str, _> = previous.tool_servers.iter().map(|s| (s.id.as_str(), s)).collect();
    for server in &next.tool_servers {
        let changed = match old_servers.get(server.id.as_str()) {
            Some(old) if *old == server => continue,
            Some(_) => &mut summary.updated,
            None => &mut summary.added,
        };
        // A failed connect still leaves the server registered.
        if let Err(e) = tools.add_server(server.clone()).await {
            tracing::warn!(server = %server.id, error = %e, "Tool server change applied with errors");
        }
        changed.push(format!("tool_server:{}", server.id));
    }
    for server in &previous.tool_servers {
        let gone = !next.tool_servers.iter().any(|s| s.id == server.id);
        if gone && tools.remove_server(&server.id).await.is_ok() {
            summary.removed.push(format!("tool_server:{}", server.id));
        }
    }

    tracing::info!(
        added = summary.added.len(),
        updated = summary.updated.len(),
        removed = summary.removed.len(),
        strategy_changed = summary.strategy_changed,
        "Configuration reloaded"
    );
    summary
}
