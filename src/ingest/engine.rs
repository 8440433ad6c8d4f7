// src/ingest/engine.rs
//! Per-source update: fetch, change detection, timestamp reconciliation,
//! classification, post-processing, retained merge and publication.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::analyze::ai_adapter::ChatClient;
use crate::analyze::{ClassifyStats, Classifier};
use crate::config::{Config, ConfigHandle, Source};
use crate::ingest::icon::resolve_icon;
use crate::ingest::reconcile::{
    cap_items, canonical_sort, detect_change, display_time, merge_with_retained,
    reconcile_timestamps, refilter, should_update_display, Change, StickyTimestamps, TimestampMode,
};
use crate::ingest::types::{now_secs, FeedFetcher, FeedSnapshot, Item, LastUpdated, RetainedItem};
use crate::postprocess::PostProcessor;
use crate::snapshot::SnapshotStore;
use crate::store::{gc, CacheSet};

/// Fetches allowed in flight across all sources.
pub const FETCH_CONCURRENCY: usize = 5;

/// Prefix selecting a folder in [`Engine::refresh`] targets.
pub const FOLDER_PREFIX: &str = "folder:";

/// Refresh target that is not in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFound {
    Feed(String),
    Folder(String),
}

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFound::Feed(url) => write!(f, "feed not found: {url}"),
            NotFound::Folder(id) => write!(f, "folder not found: {id}"),
        }
    }
}

impl std::error::Error for NotFound {}

/// Is this error (anywhere in its chain) an unknown-target error?
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.downcast_ref::<NotFound>().is_some())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateMode {
    /// Operator-triggered (API refresh or config reload).
    pub manual: bool,
    /// Skip change detection and rebuild the snapshot.
    pub force: bool,
}

impl UpdateMode {
    pub const SCHEDULED: UpdateMode = UpdateMode {
        manual: false,
        force: false,
    };
    pub const MANUAL: UpdateMode = UpdateMode {
        manual: true,
        force: false,
    };
    pub const FORCED: UpdateMode = UpdateMode {
        manual: false,
        force: true,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Upstream matched the previous snapshot; nothing was reprocessed.
    Unchanged { confirmed_placeholder: bool },
    Published {
        items: usize,
        filtered_out: usize,
        stats: ClassifyStats,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub requested: usize,
    pub failed: usize,
}

pub struct Engine {
    config: ConfigHandle,
    caches: Arc<CacheSet>,
    snapshots: SnapshotStore,
    fetcher: Arc<dyn FeedFetcher>,
    classifier: Classifier,
    post: PostProcessor,
    gate: Arc<Semaphore>,
}

impl Engine {
    pub fn new(
        config: ConfigHandle,
        caches: Arc<CacheSet>,
        snapshots: SnapshotStore,
        fetcher: Arc<dyn FeedFetcher>,
        chat: Option<Arc<dyn ChatClient>>,
    ) -> Self {
        Self {
            classifier: Classifier::new(caches.clone(), chat.clone()),
            post: PostProcessor::new(caches.clone(), chat),
            config,
            caches,
            snapshots,
            fetcher,
            gate: Arc::new(Semaphore::new(FETCH_CONCURRENCY)),
        }
    }

    /// Replace the global fetch gate size.
    pub fn with_fetch_concurrency(mut self, permits: usize) -> Self {
        self.gate = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn caches(&self) -> &Arc<CacheSet> {
        &self.caches
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn snapshot(&self, url: &str) -> Option<Arc<FeedSnapshot>> {
        self.snapshots.get(url)
    }

    /// Update one source. The previous snapshot stays in place unless the
    /// whole cycle succeeds; only fetch/parse failures are returned as errors.
    pub async fn update(&self, url: &str, as_of: DateTime<Utc>, mode: UpdateMode) -> Result<UpdateOutcome> {
        let cfg = self.config.current();
        let source = cfg
            .source(url)
            .cloned()
            .ok_or_else(|| NotFound::Feed(url.to_string()))?;

        let _permit = self
            .gate
            .acquire()
            .await
            .context("fetch gate closed")?;

        counter!("feed_fetches_total").increment(1);
        let feed = match self.fetcher.fetch(url).await {
            Ok(feed) => feed,
            Err(e) => {
                counter!("feed_fetch_errors_total").increment(1);
                return Err(e);
            }
        };

        if source.name.is_empty() && !feed.title.is_empty() {
            self.config.adopt_source_name(url, &feed.title).await;
        }

        let capped = cap_items(feed.items, source.max_items);
        let prev = self.snapshots.get(url);

        let has_new_items = match prev.as_deref().map(|p| detect_change(p, &capped)) {
            Some(Change::Unchanged) if !mode.force => {
                let confirmed = self.snapshots.confirm_placeholder(url, as_of);
                tracing::debug!(target: "update", source = %url, confirmed, "feed unchanged");
                return Ok(UpdateOutcome::Unchanged {
                    confirmed_placeholder: confirmed,
                });
            }
            Some(Change::Changed { has_new_items }) => has_new_items,
            Some(Change::Unchanged) => false,
            None => true,
        };

        let retained = self.caches.retained.get(url);
        let sticky = StickyTimestamps::collect(prev.as_deref(), retained.as_deref());
        let items = reconcile_timestamps(&capped, TimestampMode::for_source(&source), &sticky, as_of);
        let icon = resolve_icon(&source.icon, feed.image.as_deref(), url);

        let mut sorted = items.clone();
        canonical_sort(&mut sorted);

        let (filtered, stats) = if cfg.should_filter(&source) {
            let outcome = self.classifier.classify_and_filter(items, &source, &cfg).await;
            let passed: HashMap<String, Item> = outcome
                .items
                .into_iter()
                .map(|it| (it.link.clone(), it))
                .collect();
            (refilter(&sorted, passed), outcome.stats)
        } else {
            (sorted.clone(), ClassifyStats::default())
        };
        let filtered_out = sorted.len() - filtered.len();

        let processed = self.post.process(filtered, &source, &cfg).await;

        let final_items = match source.cache_items.cap(processed.len()) {
            Some(cap) => {
                let (merged, projection) =
                    merge_with_retained(processed, retained.as_deref().unwrap_or_default(), cap);
                self.caches.retained.insert(url.to_string(), projection);
                merged
            }
            None => processed,
        };

        let compared = prev.is_some() && !mode.force && !capped.is_empty();
        let last_updated = display_time(
            &final_items,
            as_of,
            prev.as_deref().map(|p| p.last_updated),
            should_update_display(&source, compared, has_new_items),
        );
        let title = display_title(&self.config.current(), &source, &feed.title);
        let snapshot = FeedSnapshot {
            title,
            link: url.to_string(),
            icon,
            items: final_items,
            last_updated,
            filtered_count: filtered_out,
            all_item_links: capped.iter().map(|it| it.link.clone()).collect(),
            all_item_titles: capped.iter().map(|it| it.title.clone()).collect(),
        };
        let published_items = snapshot.items.len();
        let valid = valid_after_update(prev.as_deref(), retained.as_deref(), &snapshot);
        self.snapshots.publish(url, snapshot);
        counter!("feed_updates_published_total").increment(1);

        tracing::info!(
            target: "update",
            source = %url,
            items = published_items,
            filtered_out,
            new_items = has_new_items,
            forced = mode.force,
            manual = mode.manual,
            "snapshot published"
        );

        if let Some(prev) = prev {
            let caches = self.caches.clone();
            let post_enabled = source.post_process_enabled();
            let source_url = url.to_string();
            let old_links: Vec<String> = if prev.all_item_links.is_empty() {
                prev.items.iter().map(|it| it.link.clone()).collect()
            } else {
                prev.all_item_links.clone()
            };
            tokio::spawn(async move {
                let (classify, post) = gc::incremental_sweep(&caches, &old_links, &valid, post_enabled);
                if classify + post > 0 {
                    tracing::debug!(target: "gc", source = %source_url, classify, post, "incremental sweep");
                }
            });
        }

        Ok(UpdateOutcome::Published {
            items: published_items,
            filtered_out,
            stats,
        })
    }

    /// Refresh one source URL, or every source of `folder:<id>` concurrently.
    /// Folder members that fail are counted, not returned.
    pub async fn refresh(&self, target: &str, force: bool) -> Result<RefreshReport> {
        let mode = UpdateMode { manual: true, force };
        let cfg = self.config.current();

        if let Some(folder_id) = target.strip_prefix(FOLDER_PREFIX) {
            let folder = cfg
                .folder(folder_id)
                .ok_or_else(|| NotFound::Folder(folder_id.to_string()))?;
            let urls = cfg.folder_source_urls(folder);
            let results = join_all(urls.iter().map(|url| self.update(url, now_secs(), mode))).await;
            let mut report = RefreshReport {
                requested: urls.len(),
                failed: 0,
            };
            for (url, res) in urls.iter().zip(results) {
                if let Err(e) = res {
                    let msg = format!("{e:#}");
                    tracing::warn!(target: "update", folder = %folder_id, source = %url, error = %msg, "folder member refresh failed");
                    report.failed += 1;
                }
            }
            tracing::info!(target: "update", folder = %folder_id, requested = report.requested, failed = report.failed, "folder refreshed");
            return Ok(report);
        }

        self.update(target, now_secs(), mode).await?;
        Ok(RefreshReport {
            requested: 1,
            failed: 0,
        })
    }

    /// Seed a placeholder snapshot from each configured source's retained
    /// list. Returns how many snapshots were seeded.
    pub fn warm_up_snapshots(&self) -> usize {
        let cfg = self.config.current();
        let mut seeded = 0;
        for source in &cfg.sources {
            let Some(retained) = self.caches.retained.get(&source.url).filter(|r| !r.is_empty()) else {
                continue;
            };
            let snapshot = FeedSnapshot {
                title: display_title(&cfg, source, ""),
                link: source.url.clone(),
                icon: resolve_icon(&source.icon, None, &source.url),
                all_item_links: retained.iter().map(|r| r.link.clone()).collect(),
                all_item_titles: retained.iter().map(|r| r.title.clone()).collect(),
                items: retained.into_iter().map(Item::from).collect(),
                last_updated: LastUpdated::CacheLoaded,
                filtered_count: 0,
            };
            if self.snapshots.seed(&source.url, snapshot) {
                seeded += 1;
            }
        }
        tracing::info!(target: "update", seeded, "snapshots warmed from retained cache");
        seeded
    }
}

/// Configured name, else the feed's own title.
fn display_title(cfg: &Config, source: &Source, feed_title: &str) -> String {
    let configured = cfg
        .source(&source.url)
        .map(|s| s.name.as_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(source.name.as_str());
    if configured.is_empty() {
        feed_title.to_string()
    } else {
        configured.to_string()
    }
}

/// Links that keep their cache entries after an update: new full list, new
/// displayed items, previously displayed items and the retained list the
/// update started from.
fn valid_after_update(
    prev: Option<&FeedSnapshot>,
    retained: Option<&[RetainedItem]>,
    next: &FeedSnapshot,
) -> HashSet<String> {
    let mut valid: HashSet<String> = next.all_item_links.iter().cloned().collect();
    let displayed = next
        .items
        .iter()
        .chain(prev.map(|p| p.items.as_slice()).unwrap_or_default());
    for it in displayed {
        valid.insert(it.link.clone());
        if let Some(orig) = &it.original_link {
            valid.insert(orig.clone());
        }
    }
    for r in retained.unwrap_or_default() {
        valid.insert(r.link.clone());
        if let Some(orig) = &r.original_link {
            valid.insert(orig.clone());
        }
    }
    valid
}
