// src/store/gc.rs
//! Garbage collection of the link-keyed caches.
//!
//! A link is valid while it is reachable from a configured source's live
//! snapshot (full link list, displayed links, original links) or its retained
//! list. Post-process validity only counts sources with post-processing on.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigHandle, RetainedPolicy};
use crate::ingest::types::now_secs;
use crate::snapshot::SnapshotStore;
use crate::store::CacheSet;

pub const FULL_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 3600);
pub const STARTUP_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const STARTUP_POLL_ATTEMPTS: u32 = 12;

pub fn read_state_grace() -> ChronoDuration {
    ChronoDuration::days(1)
}

#[derive(Debug, Default, Clone)]
pub struct ValidLinks {
    pub all: HashSet<String>,
    pub post_process: HashSet<String>,
}

fn source_links(url: &str, snapshots: &SnapshotStore, caches: &CacheSet) -> HashSet<String> {
    let mut links = HashSet::new();
    if let Some(snap) = snapshots.get(url) {
        links.extend(snap.all_item_links.iter().cloned());
        for it in &snap.items {
            links.insert(it.link.clone());
            if let Some(orig) = &it.original_link {
                links.insert(orig.clone());
            }
        }
    }
    if let Some(retained) = caches.retained.get(url) {
        for it in retained {
            if let Some(orig) = it.original_link {
                links.insert(orig);
            }
            links.insert(it.link);
        }
    }
    links.remove("");
    links
}

pub fn collect_valid_links(cfg: &Config, snapshots: &SnapshotStore, caches: &CacheSet) -> ValidLinks {
    let mut valid = ValidLinks::default();
    for source in cfg.sources.iter().filter(|s| !s.url.is_empty()) {
        let links = source_links(&source.url, snapshots, caches);
        if source.post_process_enabled() {
            valid.post_process.extend(links.iter().cloned());
        }
        valid.all.extend(links);
    }
    valid
}

/// Enough snapshots exist to trust the valid-link set: at least one, and
/// either all sources or four fifths of them.
pub fn is_warm(cfg: &Config, snapshots: &SnapshotStore) -> bool {
    let urls = cfg.urls();
    if urls.is_empty() {
        return true;
    }
    let loaded = urls.iter().filter(|u| snapshots.contains(u)).count();
    loaded >= 1 && (loaded >= urls.len() || loaded >= urls.len() * 4 / 5)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub classify: usize,
    pub post_process: usize,
    pub retained: usize,
    pub read_state: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.classify + self.post_process + self.retained + self.read_state
    }

    fn record(&self) {
        for (cache, n) in [
            ("classify", self.classify),
            ("post_process", self.post_process),
            ("retained", self.retained),
            ("read_state", self.read_state),
        ] {
            if n > 0 {
                counter!("gc_deleted_total", "cache" => cache).increment(n as u64);
            }
        }
    }
}

pub fn sweep_classify(caches: &CacheSet, valid: &ValidLinks) -> usize {
    caches.classify.retain(|link, _| valid.all.contains(link))
}

pub fn sweep_post_process(caches: &CacheSet, valid: &ValidLinks) -> usize {
    caches.post_process.retain(|link, _| valid.post_process.contains(link))
}

/// Read markers survive while valid or younger than the grace period.
pub fn sweep_read_state(caches: &CacheSet, valid: &ValidLinks, now: DateTime<Utc>) -> usize {
    let grace = read_state_grace();
    caches
        .read_state
        .retain(|link, read_at| valid.all.contains(link) || now - *read_at < grace)
}

/// Drop retained lists of removed sources and of sources with retention off.
pub fn sweep_retained(caches: &CacheSet, cfg: &Config) -> usize {
    let keep: HashSet<&str> = cfg
        .sources
        .iter()
        .filter(|s| !s.url.is_empty() && s.cache_items != RetainedPolicy::Disabled)
        .map(|s| s.url.as_str())
        .collect();
    caches.retained.retain(|url, _| keep.contains(url))
}

/// Periodic sweep over every cache. Skipped (None) while the snapshot map is
/// cold or no valid link is known.
pub fn full_sweep(cfg: &Config, snapshots: &SnapshotStore, caches: &CacheSet, now: DateTime<Utc>) -> Option<SweepReport> {
    if !is_warm(cfg, snapshots) {
        tracing::info!(target: "gc", "skipping full sweep: snapshots not warm yet");
        return None;
    }
    let valid = collect_valid_links(cfg, snapshots, caches);
    if valid.all.is_empty() {
        tracing::info!(target: "gc", "skipping full sweep: no valid links");
        return None;
    }
    let report = SweepReport {
        classify: sweep_classify(caches, &valid),
        read_state: sweep_read_state(caches, &valid, now),
        post_process: sweep_post_process(caches, &valid),
        retained: sweep_retained(caches, cfg),
    };
    report.record();
    tracing::info!(target: "gc", ?report, "full sweep finished");
    Some(report)
}

/// Sweeps run right after a config change: retained lists always; post-process
/// and read state only when the snapshot map is warm.
pub fn config_change_sweep(cfg: &Config, snapshots: &SnapshotStore, caches: &CacheSet, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport {
        retained: sweep_retained(caches, cfg),
        ..Default::default()
    };
    if is_warm(cfg, snapshots) {
        let valid = collect_valid_links(cfg, snapshots, caches);
        report.post_process = sweep_post_process(caches, &valid);
        report.read_state = sweep_read_state(caches, &valid, now);
    } else {
        tracing::info!(target: "gc", "config change: snapshots not warm, link sweeps deferred");
    }
    report.record();
    if report.total() > 0 {
        tracing::info!(target: "gc", ?report, "config change sweep finished");
    }
    report
}

/// Per-source sweep after an update: links that were known before but are in
/// none of the current sets lose their classification (and, when
/// post-processing is on, post-process) entries.
pub fn incremental_sweep(
    caches: &CacheSet,
    old_links: &[String],
    current: &HashSet<String>,
    post_process_enabled: bool,
) -> (usize, usize) {
    let stale: Vec<String> = old_links
        .iter()
        .filter(|l| !l.is_empty() && !current.contains(*l))
        .cloned()
        .collect();
    if stale.is_empty() {
        return (0, 0);
    }
    let classify = caches.classify.remove_many(stale.iter().cloned());
    let post = if post_process_enabled {
        caches.post_process.remove_many(stale)
    } else {
        0
    };
    SweepReport {
        classify,
        post_process: post,
        ..Default::default()
    }
    .record();
    (classify, post)
}

/// Remove the classification entries of every link known for one source.
pub fn clear_classify_cache_for_source(caches: &CacheSet, snapshots: &SnapshotStore, url: &str) -> usize {
    let n = caches
        .classify
        .remove_many(source_links(url, snapshots, caches));
    if n > 0 {
        tracing::info!(target: "gc", source = %url, removed = n, "cleared classification cache for source");
    }
    n
}

pub fn clear_post_process_cache_for_source(caches: &CacheSet, snapshots: &SnapshotStore, url: &str) -> usize {
    let n = caches
        .post_process
        .remove_many(source_links(url, snapshots, caches));
    if n > 0 {
        tracing::info!(target: "gc", source = %url, removed = n, "cleared post-process cache for source");
    }
    n
}

pub fn spawn_periodic_sweep(
    config: ConfigHandle,
    snapshots: SnapshotStore,
    caches: Arc<CacheSet>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cfg = config.current();
            full_sweep(&cfg, &snapshots, &caches, now_secs());
        }
    })
}

/// After startup, wait for the snapshot map to warm up (bounded), then run
/// the config-change sweeps once to drop data orphaned while offline.
pub fn spawn_startup_sweep(
    config: ConfigHandle,
    snapshots: SnapshotStore,
    caches: Arc<CacheSet>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for _ in 0..STARTUP_POLL_ATTEMPTS {
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
            let cfg = config.current();
            if is_warm(&cfg, &snapshots) {
                config_change_sweep(&cfg, &snapshots, &caches, now_secs());
                return;
            }
        }
        tracing::info!(target: "gc", "startup sweep abandoned: snapshots never warmed up");
    })
}
