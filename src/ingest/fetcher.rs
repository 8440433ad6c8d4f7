// src/ingest/fetcher.rs
//! Default [`FeedFetcher`]: reqwest + feed-rs (RSS, Atom, JSON Feed).

use anyhow::{bail, Context, Result};
use chrono::{SubsecRound, Utc};
use std::time::Duration;

use crate::ingest::types::{FeedFetcher, RawFeed, RawItem};

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("rss-curator/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building feed http client")?;
        Ok(Self { client })
    }
}

/// Parse a feed document. Entries without a link are skipped; document order
/// is preserved.
pub fn parse_feed(bytes: &[u8]) -> Result<RawFeed> {
    let feed = feed_rs::parser::parse(bytes).context("parsing feed document")?;

    let image = feed
        .logo
        .as_ref()
        .or(feed.icon.as_ref())
        .map(|img| img.uri.clone())
        .filter(|u| !u.is_empty());

    let items = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry
                .links
                .first()
                .map(|l| l.href.trim().to_string())
                .filter(|l| !l.is_empty())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))?;
            let description = entry
                .summary
                .map(|t| t.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();
            Some(RawItem {
                title: entry.title.map(|t| t.content.trim().to_string()).unwrap_or_default(),
                link,
                description,
                published: entry.published.map(|d| d.with_timezone(&Utc).trunc_subsecs(0)),
                updated: entry.updated.map(|d| d.with_timezone(&Utc).trunc_subsecs(0)),
            })
        })
        .collect();

    Ok(RawFeed {
        title: feed.title.map(|t| t.content.trim().to_string()).unwrap_or_default(),
        image,
        items,
    })
}

#[async_trait::async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<RawFeed> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("fetching {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("fetching {url}: HTTP {status}");
        }
        let bytes = resp.bytes().await.context("reading feed body")?;
        parse_feed(&bytes).with_context(|| format!("feed {url}"))
    }
}
