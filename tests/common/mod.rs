// tests/common/mod.rs
//
// Shared fakes for the integration tests: a scripted feed fetcher and a
// chat client that answers from a fixed rule.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;

use rss_curator::analyze::ai_adapter::{ChatClient, ChatRequest};
use rss_curator::config::{Category, ClassifyStrategy, Config, Source};
use rss_curator::ingest::types::{FeedFetcher, RawFeed, RawItem};
use rss_curator::store::{CacheSet, DurableStore, MemoryStore};
use rss_curator::{ConfigHandle, Engine, SnapshotStore};

pub fn ts(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, h, m, 0).unwrap()
}

pub fn raw(link: &str, title: &str) -> RawItem {
    RawItem {
        title: title.to_string(),
        link: link.to_string(),
        ..Default::default()
    }
}

pub fn raw_at(link: &str, title: &str, published: DateTime<Utc>) -> RawItem {
    RawItem {
        published: Some(published),
        ..raw(link, title)
    }
}

/// Per-URL scripted documents; URLs without a document fail to fetch.
#[derive(Default)]
pub struct ScriptedFetcher {
    feeds: Mutex<HashMap<String, RawFeed>>,
    /// Remaining forced failures per URL.
    failures: Mutex<HashMap<String, usize>>,
    pub calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, url: &str, title: &str, items: Vec<RawItem>) {
        self.feeds.lock().unwrap().insert(
            url.to_string(),
            RawFeed {
                title: title.to_string(),
                image: None,
                items,
            },
        );
    }

    pub fn fail_next(&self, url: &str, times: usize) {
        self.failures.lock().unwrap().insert(url.to_string(), times);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<RawFeed> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(n) = failures.get_mut(url).filter(|n| **n > 0) {
                *n -= 1;
                anyhow::bail!("connection reset fetching {url}");
            }
        }
        self.feeds
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such feed {url}"))
    }
}

/// Answers "tech" for every article whose title does not contain `skip`;
/// articles containing it are left out of the reply map.
pub struct RuleChat {
    pub skip: String,
    pub calls: AtomicUsize,
}

impl RuleChat {
    pub fn new(skip: &str) -> Arc<Self> {
        Arc::new(Self {
            skip: skip.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChatClient for RuleChat {
    async fn complete(&self, req: &ChatRequest) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let re = Regex::new(r"--- Article ID: (\d+) ---\nTitle: ([^\n]*)").unwrap();
        let entries: Vec<String> = re
            .captures_iter(&req.user)
            .filter(|c| self.skip.is_empty() || !c[2].contains(&self.skip))
            .map(|c| format!("\"{}\": \"tech\"", &c[1]))
            .collect();
        Ok(format!("{{\"results\": {{{}}}}}", entries.join(", ")))
    }
}

pub fn source(url: &str) -> Source {
    Source {
        url: url.to_string(),
        ..Default::default()
    }
}

pub fn ai_source(url: &str) -> Source {
    Source {
        classify: Some(ClassifyStrategy {
            ai_enabled: true,
            ..Default::default()
        }),
        ..source(url)
    }
}

/// Config with one usable AI backend and a two-category taxonomy.
pub fn ai_config(sources: Vec<Source>) -> Config {
    let mut cfg = Config {
        sources,
        categories: vec![
            Category {
                id: "tech".into(),
                name: "Technology".into(),
                ..Default::default()
            },
            Category {
                id: "life".into(),
                name: "Lifestyle".into(),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    cfg.ai_classify.enabled = true;
    cfg.ai_classify.api_key = "test-key".into();
    cfg.ai_classify.batch_size = 5;
    cfg.ai_classify.retry_count = -1;
    cfg
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub store: Arc<MemoryStore>,
}

pub fn harness(cfg: Config, chat: Option<Arc<dyn ChatClient>>) -> Harness {
    harness_with(ConfigHandle::new(cfg), chat)
}

pub fn harness_with(config: ConfigHandle, chat: Option<Arc<dyn ChatClient>>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let durable: Arc<dyn DurableStore> = store.clone();
    let caches = Arc::new(CacheSet::new(durable));
    let fetcher = ScriptedFetcher::new();
    let engine = Arc::new(Engine::new(
        config,
        caches,
        SnapshotStore::new(),
        fetcher.clone(),
        chat,
    ));
    Harness {
        engine,
        fetcher,
        store,
    }
}

/// Poll `cond` until it holds or ~2s pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
