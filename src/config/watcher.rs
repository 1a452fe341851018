//! Configuration file watcher for hot reload.
//!
//! Filesystem events are coalesced: editors commonly emit several writes per
//! save, so a reload runs once the file has been quiet for [`SETTLE_DELAY`].
//! A reload whose content is byte-identical to the last applied file is
//! dropped.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::parse_config;
use crate::config::schema::OrchestratorConfig;

/// Quiet period after the last filesystem event before reloading.
pub const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Handle on a running watcher. Dropping it stops the watch.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Watch `path`, sending each validated, changed configuration on the
    /// returned channel. Invalid files are logged and skipped.
    pub fn spawn(
        path: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<OrchestratorConfig>), notify::Error> {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = event_tx.send(());
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        let initial = std::fs::read_to_string(path).ok();
        let task = tokio::spawn(reload_loop(path.to_path_buf(), initial, event_rx, update_tx));

        tracing::info!(path = ?path, "Config watcher started");
        Ok((
            Self {
                _watcher: watcher,
                task,
            },
            update_rx,
        ))
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn reload_loop(
    path: PathBuf,
    mut last_applied: Option<String>,
    mut events: mpsc::UnboundedReceiver<()>,
    updates: mpsc::UnboundedSender<OrchestratorConfig>,
) {
    while events.recv().await.is_some() {
        // Settle: keep absorbing events until the file has been quiet.
        loop {
            match tokio::time::timeout(SETTLE_DELAY, events.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "Failed to read config, keeping current configuration");
                continue;
            }
        };
        if last_applied.as_deref() == Some(content.as_str()) {
            tracing::debug!(path = ?path, "Config unchanged, skipping reload");
            continue;
        }

        match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = ?path, "Config file change detected, reloading");
                last_applied = Some(content);
                if updates.send(config).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(
                    "Failed to reload config: {}. Keeping current configuration.",
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reload_loop_coalesces_and_skips_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(&path, "strategy = \"round_robin\"\n").unwrap();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let initial = std::fs::read_to_string(&path).ok();
        let task = tokio::spawn(reload_loop(path.clone(), initial, event_rx, update_tx));

        // Touch without change: nothing is emitted.
        event_tx.send(()).unwrap();
        tokio::time::sleep(SETTLE_DELAY * 3).await;
        assert!(update_rx.try_recv().is_err());

        std::fs::write(&path, "strategy = \"weighted\"\n").unwrap();
        for _ in 0..3 {
            event_tx.send(()).unwrap();
        }
        let config = tokio::time::timeout(Duration::from_secs(2), update_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(config.strategy, crate::config::StrategyKind::Weighted);
        assert!(update_rx.try_recv().is_err());

        drop(event_tx);
        task.await.unwrap();
    }
}
