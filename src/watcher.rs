// src/watcher.rs
//! Config reconciliation: watch the config file, debounce change bursts,
//! reload, sweep caches and force-refresh the sources whose cache-affecting
//! settings changed.

use anyhow::{anyhow, Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::diff::affected_sources;
use crate::config::Config;
use crate::ingest::engine::{Engine, UpdateMode};
use crate::ingest::types::now_secs;
use crate::store::gc::{self, SweepReport};

pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);
pub const RELOAD_ATTEMPTS: u32 = 3;
pub const RELOAD_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Reloads run after a reconfiguration.
const RELOAD_MODE: UpdateMode = UpdateMode {
    manual: true,
    force: true,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Sources given a forced reprocess.
    pub affected: Vec<String>,
    /// Sources dropped from the config whose snapshots were removed.
    pub removed: Vec<String>,
    pub sweep: SweepReport,
}

pub struct ConfigCoordinator {
    engine: Arc<Engine>,
}

/// Keeps the OS watcher alive alongside the reload task.
pub struct ConfigWatch {
    _watcher: RecommendedWatcher,
    pub task: JoinHandle<()>,
}

impl ConfigCoordinator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    fn config_path(&self) -> Result<PathBuf> {
        self.engine
            .config()
            .path()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("config handle has no backing file"))
    }

    /// Read the file (retrying briefly while a writer finishes) and apply it.
    /// On failure the previous configuration stays in effect.
    pub async fn reload_now(&self) -> Result<ReloadReport> {
        let path = self.config_path()?;
        let mut last_err = None;
        for attempt in 1..=RELOAD_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(RELOAD_RETRY_DELAY).await;
            }
            match Config::load(&path).await {
                Ok(cfg) => return Ok(self.apply(cfg)),
                Err(e) => {
                    let msg = format!("{e:#}");
                    tracing::warn!(target: "config", attempt, error = %msg, "config reload attempt failed");
                    last_err = Some(e);
                }
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("config reload failed"));
        Err(err.context("keeping previous configuration"))
    }

    /// Swap in `cfg`, run the config-change sweeps and dispatch forced
    /// updates for affected sources.
    pub fn apply(&self, cfg: Config) -> ReloadReport {
        let handle = self.engine.config();
        let old = handle.replace(cfg);
        let new = handle.current();

        let current: HashSet<String> = new.urls().into_iter().collect();
        let removed: Vec<String> = old
            .urls()
            .into_iter()
            .filter(|u| !current.contains(u))
            .filter(|u| self.engine.snapshots().remove(u).is_some())
            .collect();

        let sweep = gc::config_change_sweep(&new, self.engine.snapshots(), self.engine.caches(), now_secs());
        let affected: Vec<String> = affected_sources(&old, &new).into_iter().collect();

        tracing::info!(
            target: "config",
            sources = new.sources.len(),
            affected = affected.len(),
            removed = removed.len(),
            "configuration reloaded"
        );

        for url in &affected {
            let engine = self.engine.clone();
            let url = url.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.update(&url, now_secs(), RELOAD_MODE).await {
                    let msg = format!("{e:#}");
                    tracing::warn!(target: "config", source = %url, error = %msg, "forced refresh after reload failed");
                }
            });
        }

        ReloadReport {
            affected,
            removed,
            sweep,
        }
    }

    /// Watch the config file's directory (atomic renames replace the inode)
    /// and reload once a burst of events has been quiet for `debounce`.
    pub fn spawn_watch(self: Arc<Self>, debounce: Duration) -> Result<ConfigWatch> {
        let path = self.config_path()?;
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| anyhow!("config path {} has no file name", path.display()))?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, mut rx) = mpsc::channel::<()>(64);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let relevant = !matches!(event.kind, EventKind::Access(_))
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if relevant {
                    let _ = tx.try_send(());
                }
            }
            Err(e) => tracing::warn!(target: "config", error = %e, "config watcher error"),
        })
        .context("creating config watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", dir.display()))?;
        tracing::info!(target: "config", path = %path.display(), "watching config file");

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                if let Err(e) = self.reload_now().await {
                    let msg = format!("{e:#}");
                    tracing::error!(target: "config", error = %msg, "config reload failed");
                }
            }
        });

        Ok(ConfigWatch {
            _watcher: watcher,
            task,
        })
    }
}
