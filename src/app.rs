// src/app.rs
//! Process wiring: settings from the environment, store and cache loading,
//! warm-up and the background loops.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::analyze::ai_adapter::{ChatClient, OpenAiCompatClient};
use crate::api::{create_router, AppState};
use crate::config::{config_path_from_env, Config, ConfigHandle};
use crate::ingest::engine::Engine;
use crate::ingest::fetcher::HttpFeedFetcher;
use crate::ingest::scheduler::{RefreshScheduler, TICK_INTERVAL};
use crate::snapshot::SnapshotStore;
use crate::store::caches::FLUSH_INTERVAL;
use crate::store::gc::{spawn_periodic_sweep, spawn_startup_sweep, FULL_SWEEP_INTERVAL};
use crate::store::{CacheSet, JsonFileStore};
use crate::watcher::{ConfigCoordinator, ConfigWatch, RELOAD_DEBOUNCE};

pub const ENV_DATA_DIR: &str = "DATA_DIR";
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const ENV_BIND_ADDR: &str = "BIND_ADDR";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
        let bind = std::env::var(ENV_BIND_ADDR).unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind
            .parse()
            .with_context(|| format!("invalid {ENV_BIND_ADDR} {bind:?}"))?;
        Ok(Self {
            config_path: config_path_from_env(),
            data_dir,
            bind_addr,
        })
    }
}

pub struct App {
    pub engine: Arc<Engine>,
    pub scheduler: Arc<RefreshScheduler>,
    pub coordinator: Arc<ConfigCoordinator>,
}

/// Background tasks of a running [`App`].
pub struct Running {
    pub tasks: Vec<JoinHandle<()>>,
    pub watch: Option<ConfigWatch>,
}

impl App {
    /// Load config and caches, then seed snapshots from the retained cache.
    pub async fn bootstrap(settings: &Settings) -> Result<Self> {
        let cfg = Config::load(&settings.config_path).await?;
        tracing::info!(
            target: "config",
            path = %settings.config_path.display(),
            sources = cfg.sources.len(),
            "configuration loaded"
        );
        let config = ConfigHandle::with_path(cfg, settings.config_path.clone());

        let store = Arc::new(JsonFileStore::open(&settings.data_dir)?);
        let caches = Arc::new(CacheSet::new(store));
        caches.load().await.context("loading caches")?;

        let fetcher = Arc::new(HttpFeedFetcher::new()?);
        let chat: Arc<dyn ChatClient> = Arc::new(OpenAiCompatClient::new(config.clone())?);
        let engine = Arc::new(Engine::new(
            config,
            caches,
            SnapshotStore::new(),
            fetcher,
            Some(chat),
        ));
        engine.warm_up_snapshots();

        Ok(Self {
            scheduler: Arc::new(RefreshScheduler::new(engine.clone())),
            coordinator: Arc::new(ConfigCoordinator::new(engine.clone())),
            engine,
        })
    }

    /// Start the flush, GC and scheduler loops and the config watcher. A
    /// watcher that cannot be created is logged; the process keeps running
    /// on the loaded configuration.
    pub fn start(&self) -> Running {
        let caches = self.engine.caches().clone();
        let config = self.engine.config().clone();
        let snapshots = self.engine.snapshots().clone();

        let tasks = vec![
            caches.clone().spawn_flush_loop(FLUSH_INTERVAL),
            spawn_periodic_sweep(config.clone(), snapshots.clone(), caches.clone(), FULL_SWEEP_INTERVAL),
            spawn_startup_sweep(config, snapshots, caches),
            self.scheduler.clone().spawn(TICK_INTERVAL),
        ];

        let watch = match self.coordinator.clone().spawn_watch(RELOAD_DEBOUNCE) {
            Ok(w) => Some(w),
            Err(e) => {
                let msg = format!("{e:#}");
                tracing::warn!(target: "config", error = %msg, "config hot reload disabled");
                None
            }
        };
        Running { tasks, watch }
    }

    pub fn router(&self) -> axum::Router {
        create_router(AppState::new(
            self.engine.clone(),
            Some(self.scheduler.clone()),
        ))
    }

    /// Persist every cache; used on shutdown.
    pub async fn flush(&self) -> Result<()> {
        self.engine.caches().flush_all().await
    }
}
