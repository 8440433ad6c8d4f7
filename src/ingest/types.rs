// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Category assigned when a keep keyword matched; bypasses category filtering.
pub const CATEGORY_KEEP: &str = "_keep";
/// Category assigned when a filter keyword matched (or whitelist mode missed).
pub const CATEGORY_FILTERED: &str = "_filtered";

/// Current instant at the second resolution used for all item timestamps.
pub fn now_secs() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// One entry as returned by the feed parser, before reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

/// Parsed remote document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFeed {
    pub title: String,
    /// Feed-declared image/logo URL.
    pub image: Option<String>,
    pub items: Vec<RawItem>,
}

/// Fetch + parse collaborator. Errors here are the only ones the scheduler retries.
#[async_trait::async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<RawFeed>;
}

/// An article after timestamp reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub title: String,
    pub link: String,
    /// Link before post-processing rewrote it; used for cache lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_link: Option<String>,
    #[serde(default)]
    pub description: String,
    pub pub_date: DateTime<Utc>,
    /// First time this link was observed; drives the "last updated" display.
    pub fetch_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    /// Position in the upstream document; tie-breaker for equal timestamps.
    #[serde(skip)]
    pub original_index: usize,
}

impl Item {
    /// Key used by the post-process cache: the pre-rewrite link.
    pub fn cache_link(&self) -> &str {
        self.original_link.as_deref().unwrap_or(&self.link)
    }
}

/// Minimal projection persisted in the retained-items cache (no description).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetainedItem {
    pub title: String,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_link: Option<String>,
    pub pub_date: DateTime<Utc>,
    pub fetch_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
}

impl From<&Item> for RetainedItem {
    fn from(it: &Item) -> Self {
        Self {
            title: it.title.clone(),
            link: it.link.clone(),
            original_link: it.original_link.clone(),
            pub_date: it.pub_date,
            fetch_time: it.fetch_time,
            category: it.category.clone(),
        }
    }
}

impl From<RetainedItem> for Item {
    fn from(r: RetainedItem) -> Self {
        Self {
            title: r.title,
            link: r.link,
            original_link: r.original_link,
            description: String::new(),
            pub_date: r.pub_date,
            fetch_time: r.fetch_time,
            category: r.category,
            original_index: 0,
        }
    }
}

/// Post-process cache value: the rewritten fields for one original link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostProcessEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_date: Option<DateTime<Utc>>,
    pub processed_at: DateTime<Utc>,
}

/// Display marker of a snapshot's freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LastUpdated {
    /// No snapshot content yet.
    Loading,
    /// Seeded from the retained cache at startup; no fetch has confirmed it.
    CacheLoaded,
    At(DateTime<Utc>),
}

impl LastUpdated {
    pub fn is_placeholder(&self) -> bool {
        !matches!(self, LastUpdated::At(_))
    }
}

/// Published, read-only state of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSnapshot {
    pub title: String,
    pub link: String,
    pub icon: String,
    pub items: Vec<Item>,
    pub last_updated: LastUpdated,
    pub filtered_count: usize,
    /// Pre-filter links in upstream order (change detection, cache validity).
    #[serde(skip)]
    pub all_item_links: Vec<String>,
    #[serde(skip)]
    pub all_item_titles: Vec<String>,
}
