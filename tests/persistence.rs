// tests/persistence.rs
//
// Restart behaviour: caches written through the JSON file store come back on
// the next start, retained categories are restored, snapshots are warmed
// from the retained cache, and settings come from the environment.

mod common;

use std::sync::Arc;

use common::*;
use rss_curator::app::Settings;
use rss_curator::ingest::scheduler::RefreshScheduler;
use rss_curator::ingest::types::LastUpdated;
use rss_curator::store::{gc, CacheSet, JsonFileStore, Table};
use rss_curator::{ConfigHandle, Engine, SnapshotStore, UpdateMode, UpdateOutcome};
use serial_test::serial;
use tempfile::TempDir;

const FEED: &str = "https://news.test/rss";

fn engine_on(dir: &TempDir, fetcher: Arc<ScriptedFetcher>) -> (Arc<Engine>, Arc<CacheSet>) {
    let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());
    let caches = Arc::new(CacheSet::new(store));
    let cfg = ai_config(vec![source(FEED)]);
    let engine = Arc::new(Engine::new(
        ConfigHandle::new(cfg),
        caches.clone(),
        SnapshotStore::new(),
        fetcher,
        None,
    ));
    (engine, caches)
}

#[tokio::test]
async fn restart_restores_caches_and_warms_snapshots() {
    let dir = TempDir::new().unwrap();
    let fetcher = ScriptedFetcher::new();
    fetcher.set(
        FEED,
        "News",
        vec![
            raw_at("https://news.test/1", "one", ts(9, 0)),
            raw_at("https://news.test/2", "two", ts(8, 0)),
        ],
    );

    {
        let (engine, caches) = engine_on(&dir, fetcher.clone());
        engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
        caches.classify.insert("https://news.test/1".into(), "tech".into());
        caches.mark_read("https://news.test/2");
        caches.flush_all().await.unwrap();
    }
    assert!(dir.path().join(format!("{}.json", Table::RetainedItems.name())).exists());

    let (engine, caches) = engine_on(&dir, fetcher.clone());
    caches.load().await.unwrap();
    assert!(caches.is_read("https://news.test/2"));

    let retained = caches.retained.get(FEED).unwrap();
    assert_eq!(retained.len(), 2);
    let first = retained.iter().find(|r| r.link == "https://news.test/1").unwrap();
    assert_eq!(first.category, "tech");

    assert_eq!(engine.warm_up_snapshots(), 1);
    let seeded = engine.snapshot(FEED).unwrap();
    assert_eq!(seeded.last_updated, LastUpdated::CacheLoaded);
    assert_eq!(seeded.items.len(), 2);
    assert_eq!(seeded.items[0].category, "tech");

    let out = engine.update(FEED, ts(10, 30), UpdateMode::SCHEDULED).await.unwrap();
    assert_eq!(out, UpdateOutcome::Unchanged { confirmed_placeholder: true });
    assert_eq!(engine.snapshot(FEED).unwrap().last_updated, LastUpdated::At(ts(10, 30)));
}

#[tokio::test]
async fn warm_cache_gates_the_full_sweep() {
    let dir = TempDir::new().unwrap();
    let fetcher = ScriptedFetcher::new();
    fetcher.set(FEED, "News", vec![raw("https://news.test/1", "one")]);
    let (engine, caches) = engine_on(&dir, fetcher);
    caches.classify.insert("https://gone.test/x".into(), "tech".into());

    let cfg = engine.config().current();
    assert!(gc::full_sweep(&cfg, engine.snapshots(), &caches, ts(12, 0)).is_none());
    assert!(caches.classify.contains("https://gone.test/x"));

    engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
    let report = gc::full_sweep(&cfg, engine.snapshots(), &caches, ts(12, 0)).unwrap();
    assert_eq!(report.classify, 1);
    assert!(!caches.classify.contains("https://gone.test/x"));
}

#[tokio::test]
async fn scheduler_has_no_next_update_before_first_tick() {
    let dir = TempDir::new().unwrap();
    let (engine, _) = engine_on(&dir, ScriptedFetcher::new());
    let sched = RefreshScheduler::new(engine);
    assert!(sched.next_global_update().is_none());
}

#[test]
#[serial]
fn settings_read_the_environment() {
    std::env::set_var("DATA_DIR", "/tmp/curator-data");
    std::env::set_var("BIND_ADDR", "127.0.0.1:9099");
    std::env::set_var("CURATOR_CONFIG_PATH", "/etc/curator/config.json");

    let s = Settings::from_env().unwrap();
    assert_eq!(s.data_dir, std::path::PathBuf::from("/tmp/curator-data"));
    assert_eq!(s.bind_addr.port(), 9099);
    assert_eq!(s.config_path, std::path::PathBuf::from("/etc/curator/config.json"));

    std::env::set_var("BIND_ADDR", "not an address");
    assert!(Settings::from_env().is_err());

    for key in ["DATA_DIR", "BIND_ADDR", "CURATOR_CONFIG_PATH"] {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn settings_fall_back_to_defaults() {
    for key in ["DATA_DIR", "BIND_ADDR", "CURATOR_CONFIG_PATH"] {
        std::env::remove_var(key);
    }
    let s = Settings::from_env().unwrap();
    assert_eq!(s.data_dir, std::path::PathBuf::from("./data"));
    assert_eq!(s.bind_addr.port(), 8080);
    assert_eq!(s.config_path, std::path::PathBuf::from("config.json"));
}
