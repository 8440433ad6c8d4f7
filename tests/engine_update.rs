// tests/engine_update.rs
//
// Update-cycle behaviour of the engine against a scripted fetcher and chat
// backend: idempotence, partial AI failures, forced reprocessing, retained
// cache bounds, ordering, display time, the fetch gate and incremental cache
// reconciliation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::future::join_all;
use rss_curator::analyze::ai_adapter::ChatClient;
use rss_curator::config::{ClassifyStrategy, Folder, FolderEntry, RetainedPolicy};
use rss_curator::ingest::engine::FETCH_CONCURRENCY;
use rss_curator::ingest::reconcile::canonical_sort;
use rss_curator::ingest::types::{FeedFetcher, LastUpdated, RawFeed};
use rss_curator::store::{CacheSet, MemoryStore, Table};
use rss_curator::{ConfigHandle, Engine, SnapshotStore, UpdateMode, UpdateOutcome};

const FEED: &str = "https://news.test/rss";

fn five_items() -> Vec<rss_curator::ingest::types::RawItem> {
    vec![
        raw_at("https://news.test/1", "Rust 2.0 released", ts(9, 0)),
        raw_at("https://news.test/2", "Garden tips skip", ts(8, 0)),
        raw_at("https://news.test/3", "New CPU benchmarks", ts(7, 0)),
        raw_at("https://news.test/4", "Cooking skip", ts(6, 0)),
        raw_at("https://news.test/5", "Kernel patches", ts(5, 0)),
    ]
}

#[tokio::test]
async fn unchanged_feed_is_idempotent_and_skips_ai() {
    let chat = RuleChat::new("");
    let h = harness(ai_config(vec![ai_source(FEED)]), Some(chat.clone() as Arc<dyn ChatClient>));
    h.fetcher.set(FEED, "News", five_items());

    let first = h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
    assert!(matches!(first, UpdateOutcome::Published { items: 5, .. }));
    let calls_after_first = chat.calls();
    assert_eq!(calls_after_first, 1, "five items fit one batch");
    let snap1 = h.engine.snapshot(FEED).unwrap();

    let second = h.engine.update(FEED, ts(10, 5), UpdateMode::SCHEDULED).await.unwrap();
    assert_eq!(second, UpdateOutcome::Unchanged { confirmed_placeholder: false });
    assert_eq!(chat.calls(), calls_after_first, "no AI calls on unchanged content");
    let snap2 = h.engine.snapshot(FEED).unwrap();
    assert_eq!(*snap1, *snap2);
}

#[tokio::test]
async fn missing_ai_indices_pass_through_unclassified() {
    let chat = RuleChat::new("skip");
    let h = harness(ai_config(vec![ai_source(FEED)]), Some(chat.clone() as Arc<dyn ChatClient>));
    h.fetcher.set(FEED, "News", five_items());

    let out = h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
    let UpdateOutcome::Published { items, stats, .. } = out else {
        panic!("expected a published snapshot");
    };
    assert_eq!(items, 5);
    assert_eq!(stats.ai_batches, 1);
    assert_eq!(stats.ai_classified, 3);
    assert_eq!(stats.ai_failed, 2);

    let snap = h.engine.snapshot(FEED).unwrap();
    let uncategorised: Vec<&str> = snap
        .items
        .iter()
        .filter(|it| it.category.is_empty())
        .map(|it| it.link.as_str())
        .collect();
    assert_eq!(uncategorised, vec!["https://news.test/2", "https://news.test/4"]);
    assert!(!h.engine.caches().classify.contains("https://news.test/2"));
    assert_eq!(
        h.engine.caches().classify.get("https://news.test/1").as_deref(),
        Some("tech")
    );
}

#[tokio::test]
async fn whitelist_drops_unclassified_items() {
    let mut src = ai_source(FEED);
    src.classify = Some(ClassifyStrategy {
        ai_enabled: true,
        category_whitelist: vec!["tech".into()],
        ..Default::default()
    });
    let h = harness(ai_config(vec![src]), Some(RuleChat::new("skip") as Arc<dyn ChatClient>));
    h.fetcher.set(FEED, "News", five_items());

    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
    let snap = h.engine.snapshot(FEED).unwrap();
    assert_eq!(snap.items.len(), 3);
    assert_eq!(snap.filtered_count, 2);
    assert!(snap.items.iter().all(|it| it.category == "tech"));
}

#[tokio::test]
async fn forced_update_rebuilds_an_unchanged_feed() {
    let h = harness(ai_config(vec![source(FEED)]), None);
    h.fetcher.set(FEED, "News", five_items());
    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();

    let out = h.engine.update(FEED, ts(10, 5), UpdateMode::FORCED).await.unwrap();
    assert!(matches!(out, UpdateOutcome::Published { items: 5, .. }));
    assert_eq!(h.fetcher.calls(), 2);
}

#[tokio::test]
async fn keyword_filtering_keeps_canonical_order() {
    let mut src = source(FEED);
    src.classify = Some(ClassifyStrategy {
        keyword_enabled: true,
        filter_keywords: vec!["skip".into()],
        ..Default::default()
    });
    let h = harness(ai_config(vec![src]), None);
    // Upstream order differs from timestamp order.
    let items = vec![
        raw_at("https://news.test/a", "old", ts(1, 0)),
        raw_at("https://news.test/b", "skip me", ts(9, 0)),
        raw_at("https://news.test/c", "newest", ts(9, 30)),
        raw("https://news.test/d", "undated"),
    ];
    h.fetcher.set(FEED, "News", items);
    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();

    let snap = h.engine.snapshot(FEED).unwrap();
    let links: Vec<&str> = snap.items.iter().map(|i| i.link.as_str()).collect();
    assert_eq!(
        links,
        vec!["https://news.test/d", "https://news.test/c", "https://news.test/a"]
    );
    assert_eq!(snap.filtered_count, 1);

    let mut canonical = snap.items.clone();
    canonical_sort(&mut canonical);
    assert_eq!(canonical, snap.items);
}

#[tokio::test]
async fn ranking_mode_follows_upstream_order() {
    let mut src = source(FEED);
    src.ranking_mode = true;
    let h = harness(ai_config(vec![src]), None);

    h.fetcher.set(
        FEED,
        "Top",
        vec![
            raw_at("https://news.test/A", "A", ts(1, 0)),
            raw_at("https://news.test/B", "B", ts(9, 0)),
            raw_at("https://news.test/C", "C", ts(5, 0)),
        ],
    );
    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
    let links = |h: &Harness| -> Vec<String> {
        h.engine
            .snapshot(FEED)
            .unwrap()
            .items
            .iter()
            .map(|i| i.link.rsplit('/').next().unwrap_or_default().to_string())
            .collect()
    };
    assert_eq!(links(&h), vec!["A", "B", "C"]);

    h.fetcher.set(
        FEED,
        "Top",
        vec![
            raw("https://news.test/A", "A"),
            raw("https://news.test/C", "C"),
            raw("https://news.test/B", "B"),
        ],
    );
    h.engine.update(FEED, ts(10, 10), UpdateMode::SCHEDULED).await.unwrap();
    assert_eq!(links(&h), vec!["A", "C", "B"]);
}

#[tokio::test]
async fn retained_cache_is_capped_and_backfills() {
    let mut src = source(FEED);
    src.cache_items = RetainedPolicy::Fixed(4);
    let h = harness(ai_config(vec![src]), None);

    h.fetcher.set(
        FEED,
        "News",
        vec![
            raw_at("https://news.test/1", "one", ts(1, 0)),
            raw_at("https://news.test/2", "two", ts(2, 0)),
            raw_at("https://news.test/3", "three", ts(3, 0)),
        ],
    );
    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();

    h.fetcher.set(
        FEED,
        "News",
        vec![
            raw_at("https://news.test/4", "four", ts(4, 0)),
            raw_at("https://news.test/3", "three", ts(3, 0)),
        ],
    );
    h.engine.update(FEED, ts(11, 0), UpdateMode::SCHEDULED).await.unwrap();

    let snap = h.engine.snapshot(FEED).unwrap();
    let links: Vec<&str> = snap.items.iter().map(|i| i.link.as_str()).collect();
    assert_eq!(
        links,
        vec![
            "https://news.test/4",
            "https://news.test/3",
            "https://news.test/2",
            "https://news.test/1"
        ]
    );

    let retained = h.engine.caches().retained.get(FEED).unwrap();
    assert!(retained.len() <= 4);
    let mut unique: Vec<&str> = retained.iter().map(|r| r.link.as_str()).collect();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), retained.len());
}

#[tokio::test]
async fn disabled_retention_shows_only_live_items() {
    let mut src = source(FEED);
    src.cache_items = RetainedPolicy::Disabled;
    let h = harness(ai_config(vec![src]), None);
    h.fetcher.set(FEED, "News", five_items());
    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
    h.fetcher.set(FEED, "News", five_items().into_iter().take(2).collect());
    h.engine.update(FEED, ts(11, 0), UpdateMode::SCHEDULED).await.unwrap();

    assert_eq!(h.engine.snapshot(FEED).unwrap().items.len(), 2);
    assert!(h.engine.caches().retained.get(FEED).is_none());
}

#[tokio::test]
async fn fetch_failure_keeps_previous_snapshot() {
    let h = harness(ai_config(vec![source(FEED)]), None);
    h.fetcher.set(FEED, "News", five_items());
    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
    let before = h.engine.snapshot(FEED).unwrap();

    h.fetcher.fail_next(FEED, 1);
    assert!(h.engine.update(FEED, ts(11, 0), UpdateMode::FORCED).await.is_err());
    assert_eq!(*h.engine.snapshot(FEED).unwrap(), *before);
}

#[tokio::test]
async fn empty_feed_falls_back_to_as_of_time() {
    let mut src = source(FEED);
    src.cache_items = RetainedPolicy::Disabled;
    let h = harness(ai_config(vec![src]), None);
    h.fetcher.set(FEED, "News", Vec::new());
    h.engine.update(FEED, ts(10, 0), UpdateMode::MANUAL).await.unwrap();
    assert_eq!(
        h.engine.snapshot(FEED).unwrap().last_updated,
        LastUpdated::At(ts(10, 0))
    );
}

#[tokio::test]
async fn classification_results_reach_the_store() {
    let h = harness(
        ai_config(vec![ai_source(FEED)]),
        Some(RuleChat::new("") as Arc<dyn ChatClient>),
    );
    h.fetcher.set(FEED, "News", five_items());
    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();

    let store = h.store.clone();
    assert!(
        eventually(|| store.table(Table::Classify).len() == 5).await,
        "write-behind should persist all classifications"
    );
    assert!(eventually(|| store.get(Table::RetainedItems, FEED).is_some()).await);
}

#[tokio::test]
async fn filtered_links_leaving_the_feed_lose_cache_entries() {
    let mut src = ai_source(FEED);
    src.cache_items = RetainedPolicy::Disabled;
    src.classify = Some(ClassifyStrategy {
        ai_enabled: true,
        category_blacklist: vec!["tech".into()],
        ..Default::default()
    });
    // 1, 3 and 5 are classified "tech" and hidden; 2 and 4 stay unclassified.
    let h = harness(ai_config(vec![src]), Some(RuleChat::new("skip") as Arc<dyn ChatClient>));
    h.fetcher.set(FEED, "News", five_items());
    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
    assert_eq!(h.engine.caches().classify.len(), 3);
    assert_eq!(h.engine.snapshot(FEED).unwrap().items.len(), 2);

    h.fetcher.set(FEED, "News", five_items().into_iter().take(2).collect());
    h.engine.update(FEED, ts(10, 30), UpdateMode::SCHEDULED).await.unwrap();

    let caches = h.engine.caches().clone();
    assert!(
        eventually(|| {
            !caches.classify.contains("https://news.test/3")
                && !caches.classify.contains("https://news.test/5")
        })
        .await
    );
    assert!(caches.classify.contains("https://news.test/1"));
}

#[tokio::test]
async fn folder_refresh_counts_member_failures() {
    let other = "https://other.test/rss";
    let mut cfg = ai_config(vec![source(FEED), source(other)]);
    cfg.folders = vec![Folder {
        id: "daily".into(),
        name: "Daily".into(),
        entries: vec![
            FolderEntry {
                source_url: FEED.into(),
                ..Default::default()
            },
            FolderEntry {
                source_url: other.into(),
                ..Default::default()
            },
        ],
        ..Default::default()
    }];
    let h = harness(cfg, None);
    h.fetcher.set(FEED, "News", five_items());

    let report = h.engine.refresh("folder:daily", false).await.unwrap();
    assert_eq!(report.requested, 2);
    assert_eq!(report.failed, 1);
    assert!(h.engine.snapshot(FEED).is_some());
    assert!(h.engine.snapshot(other).is_none());
}

#[tokio::test]
async fn emptied_feed_moves_the_display_time() {
    let mut src = source(FEED);
    src.cache_items = RetainedPolicy::Disabled;
    let h = harness(ai_config(vec![src]), None);
    h.fetcher.set(FEED, "News", vec![raw_at("https://news.test/a", "a", ts(9, 0))]);
    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();

    h.fetcher.set(FEED, "News", Vec::new());
    h.engine.update(FEED, ts(11, 0), UpdateMode::SCHEDULED).await.unwrap();
    let snap = h.engine.snapshot(FEED).unwrap();
    assert!(snap.items.is_empty());
    assert_eq!(snap.last_updated, LastUpdated::At(ts(11, 0)));
}

#[tokio::test]
async fn pinned_source_holds_display_time_until_new_links() {
    let mut src = source(FEED);
    src.cache_items = RetainedPolicy::Disabled;
    src.ignore_original_pub_date = true;
    // Nothing matches the keep list, so every update publishes no items.
    src.classify = Some(ClassifyStrategy {
        whitelist_mode: true,
        keep_keywords: vec!["zzz".into()],
        ..Default::default()
    });
    let h = harness(ai_config(vec![src]), None);

    h.fetcher.set(FEED, "News", vec![raw("https://news.test/a", "one")]);
    h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
    assert_eq!(h.engine.snapshot(FEED).unwrap().last_updated, LastUpdated::At(ts(10, 0)));

    h.fetcher.set(FEED, "News", vec![raw("https://news.test/a", "one, edited")]);
    h.engine.update(FEED, ts(11, 0), UpdateMode::SCHEDULED).await.unwrap();
    assert_eq!(h.engine.snapshot(FEED).unwrap().last_updated, LastUpdated::At(ts(10, 0)));

    h.fetcher.set(
        FEED,
        "News",
        vec![raw("https://news.test/a", "one, edited"), raw("https://news.test/b", "two")],
    );
    h.engine.update(FEED, ts(12, 0), UpdateMode::SCHEDULED).await.unwrap();
    assert_eq!(h.engine.snapshot(FEED).unwrap().last_updated, LastUpdated::At(ts(12, 0)));
}

#[tokio::test]
async fn ai_results_map_back_across_batches() {
    let chat = RuleChat::new("skip");
    let h = harness(ai_config(vec![ai_source(FEED)]), Some(chat.clone() as Arc<dyn ChatClient>));
    // One skipped title per batch of five.
    let items: Vec<_> = (0..12u32)
        .map(|i| {
            let title = if matches!(i, 1 | 6 | 11) {
                format!("story {i} skip")
            } else {
                format!("story {i}")
            };
            raw_at(&format!("https://news.test/{i}"), &title, ts(9, 59 - i))
        })
        .collect();
    h.fetcher.set(FEED, "News", items);

    let out = h.engine.update(FEED, ts(10, 0), UpdateMode::SCHEDULED).await.unwrap();
    let UpdateOutcome::Published { items, stats, .. } = out else {
        panic!("expected a published snapshot");
    };
    assert_eq!(items, 12);
    assert_eq!(chat.calls(), 3);
    assert_eq!(stats.ai_batches, 3);
    assert_eq!(stats.ai_classified, 9);
    assert_eq!(stats.ai_failed, 3);

    let snap = h.engine.snapshot(FEED).unwrap();
    let mut uncategorised: Vec<&str> = snap
        .items
        .iter()
        .filter(|it| it.category.is_empty())
        .map(|it| it.link.as_str())
        .collect();
    uncategorised.sort_unstable();
    assert_eq!(
        uncategorised,
        vec!["https://news.test/1", "https://news.test/11", "https://news.test/6"]
    );
    for i in [0, 5, 9, 10] {
        assert_eq!(
            h.engine.caches().classify.get(&format!("https://news.test/{i}")).as_deref(),
            Some("tech"),
            "item {i}"
        );
    }
}

/// Holds every fetch for a while and records the peak number in flight.
#[derive(Default)]
struct SlowFetcher {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait::async_trait]
impl FeedFetcher for SlowFetcher {
    async fn fetch(&self, _url: &str) -> anyhow::Result<RawFeed> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(RawFeed {
            title: "Slow".into(),
            image: None,
            items: vec![raw("https://slow.test/1", "one")],
        })
    }
}

async fn peak_fetches(sources: usize, permits: Option<usize>) -> usize {
    let urls: Vec<String> = (0..sources).map(|i| format!("https://slow{i}.test/rss")).collect();
    let cfg = ai_config(urls.iter().map(|u| source(u)).collect());
    let fetcher = Arc::new(SlowFetcher::default());
    let mut engine = Engine::new(
        ConfigHandle::new(cfg),
        Arc::new(CacheSet::new(Arc::new(MemoryStore::new()))),
        SnapshotStore::new(),
        fetcher.clone(),
        None,
    );
    if let Some(permits) = permits {
        engine = engine.with_fetch_concurrency(permits);
    }

    let results = join_all(urls.iter().map(|u| engine.update(u, ts(10, 0), UpdateMode::SCHEDULED))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(fetcher.in_flight.load(Ordering::SeqCst), 0);
    fetcher.peak.load(Ordering::SeqCst)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetch_gate_bounds_concurrent_fetches() {
    assert_eq!(peak_fetches(6, Some(2)).await, 2);
    assert_eq!(peak_fetches(8, None).await, FETCH_CONCURRENCY);
}
