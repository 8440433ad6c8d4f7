// src/postprocess.rs
//! Optional per-item rewriting of title/link/pubDate by a script or the AI
//! backend, cached by the item's original link.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::analyze::ai_adapter::{ChatClient, ChatRequest};
use crate::analyze::response::extract_json;
use crate::analyze::script::run_script;
use crate::config::{Config, PostProcessConfig, PostProcessMode, Source};
use crate::ingest::types::{now_secs, Item, PostProcessEntry};
use crate::store::CacheSet;

const DEFAULT_PROMPT: &str = "Rewrite the article metadata. Reply with a JSON object \
containing any of the keys \"title\", \"link\" and \"pubDate\" that should change.";

/// Processor reply: any subset of the fields to override.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Override {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    pub_date: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemPayload<'a> {
    title: &'a str,
    link: &'a str,
    description: &'a str,
    pub_date: DateTime<Utc>,
}

/// RFC 3339 first, then RFC 2822 (the usual RSS form).
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .ok()
        .map(|d| d.with_timezone(&Utc).trunc_subsecs(0))
}

fn decode_override(raw: &str) -> Result<Override> {
    let json = extract_json(raw).ok_or_else(|| anyhow!("processor reply contains no JSON"))?;
    serde_json::from_str(json).context("decoding processor reply")
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Apply a cached entry, honouring the `modify*` switches.
pub fn apply_entry(mut item: Item, entry: &PostProcessEntry, pp: &PostProcessConfig) -> Item {
    if pp.modify_title {
        if let Some(t) = &entry.title {
            item.title = t.clone();
        }
    }
    if pp.modify_pub_date {
        if let Some(d) = entry.pub_date {
            item.pub_date = d;
        }
    }
    if pp.modify_link {
        if let Some(l) = entry.link.as_ref().filter(|l| **l != item.link) {
            if item.original_link.is_none() {
                item.original_link = Some(item.link.clone());
            }
            item.link = l.clone();
        }
    }
    item
}

pub struct PostProcessor {
    caches: Arc<CacheSet>,
    chat: Option<Arc<dyn ChatClient>>,
}

impl PostProcessor {
    pub fn new(caches: Arc<CacheSet>, chat: Option<Arc<dyn ChatClient>>) -> Self {
        Self { caches, chat }
    }

    /// Transform the filtered list. Order is preserved; an item whose
    /// processing fails is passed through unchanged.
    pub async fn process(&self, items: Vec<Item>, source: &Source, cfg: &Config) -> Vec<Item> {
        let Some(pp) = source.post_process.as_ref().filter(|p| p.enabled) else {
            return items;
        };
        let concurrency = cfg.ai_classify.concurrency();
        stream::iter(items)
            .map(|item| async move {
                let key = item.cache_link().to_string();
                if let Some(entry) = self.caches.post_process.get(&key) {
                    return apply_entry(item, &entry, pp);
                }
                match self.run_one(&item, pp, cfg).await {
                    Ok(entry) => {
                        self.caches.post_process.insert(key, entry.clone());
                        apply_entry(item, &entry, pp)
                    }
                    Err(e) => {
                        let msg = format!("{e:#}");
                        tracing::warn!(target: "update", source = %source.url, link = %item.link, error = %msg, "post-processing failed; keeping item");
                        item
                    }
                }
            })
            .buffered(concurrency)
            .collect()
            .await
    }

    async fn run_one(&self, item: &Item, pp: &PostProcessConfig, cfg: &Config) -> Result<PostProcessEntry> {
        let payload = ItemPayload {
            title: &item.title,
            link: &item.link,
            description: &item.description,
            pub_date: item.pub_date,
        };
        let raw = match pp.mode {
            PostProcessMode::Script => {
                let script = if !pp.script_content.trim().is_empty() {
                    pp.script_content.as_str()
                } else if !pp.script_path.trim().is_empty() {
                    pp.script_path.as_str()
                } else {
                    bail!("script post-processing has neither scriptContent nor scriptPath");
                };
                let input = serde_json::to_vec(&payload)?;
                let out = run_script(script, input, cfg.ai_classify.timeout()).await?;
                String::from_utf8_lossy(&out).into_owned()
            }
            PostProcessMode::Ai => {
                let chat = self
                    .chat
                    .as_deref()
                    .filter(|_| cfg.ai_classify.is_usable())
                    .ok_or_else(|| anyhow!("AI post-processing requested but AI is not configured"))?;
                let system = if pp.prompt.trim().is_empty() {
                    DEFAULT_PROMPT
                } else {
                    pp.prompt.as_str()
                };
                let req = ChatRequest {
                    system: system.to_string(),
                    user: serde_json::to_string(&payload)?,
                    token_factor: 1,
                    json_object: true,
                };
                chat.complete(&req).await?
            }
        };

        let ov = decode_override(&raw)?;
        Ok(PostProcessEntry {
            title: non_empty(ov.title),
            link: non_empty(ov.link),
            pub_date: ov.pub_date.as_deref().and_then(parse_timestamp),
            processed_at: now_secs(),
        })
    }
}
