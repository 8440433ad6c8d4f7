// src/analyze/mod.rs
//! Classification & filter pipeline: cache → keywords → AI batches →
//! category allow/deny → script filter.

pub mod ai_adapter;
pub mod categories;
pub mod keywords;
pub mod response;
pub mod script;

use futures::stream::{self, StreamExt};
use metrics::counter;
use once_cell::sync::OnceCell;
use regex::Regex;
use std::sync::Arc;

use crate::analyze::ai_adapter::{build_batch_request, classify_batch_with_retry, ChatClient};
use crate::config::{Config, Source};
use crate::ingest::types::{Item, CATEGORY_FILTERED};
use crate::store::CacheSet;

/// Decode entities, drop tags, collapse whitespace.
pub fn strip_html(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").unwrap());
    let text = re_tags.replace_all(&decoded, " ");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    re_ws.replace_all(&text, " ").trim().to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifyStats {
    pub cache_hits: usize,
    pub keyword_hits: usize,
    pub ai_classified: usize,
    /// Items left unclassified by the AI stage (failed batches, missing indices).
    pub ai_failed: usize,
    pub ai_batches: usize,
    pub keyword_filtered: usize,
    pub category_filtered: usize,
    pub script_filtered: usize,
    /// Script failure message; the pre-script list was kept.
    pub script_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClassifyOutcome {
    /// Survivors, categories assigned, in input order.
    pub items: Vec<Item>,
    pub stats: ClassifyStats,
}

pub struct Classifier {
    caches: Arc<CacheSet>,
    chat: Option<Arc<dyn ChatClient>>,
}

impl Classifier {
    pub fn new(caches: Arc<CacheSet>, chat: Option<Arc<dyn ChatClient>>) -> Self {
        Self { caches, chat }
    }

    pub async fn classify_and_filter(&self, mut items: Vec<Item>, source: &Source, cfg: &Config) -> ClassifyOutcome {
        let strategy = source.classify.clone().unwrap_or_default();
        let mut stats = ClassifyStats::default();

        // 1-2. cache, then keywords
        let mut pending: Vec<usize> = Vec::new();
        for (idx, it) in items.iter_mut().enumerate() {
            if let Some(cat) = self.caches.classify.get(&it.link).filter(|c| !c.is_empty()) {
                it.category = cat;
                stats.cache_hits += 1;
                continue;
            }
            if strategy.uses_keywords() {
                if let Some(cat) = keywords::evaluate(&strategy, &it.title, &it.description).category() {
                    it.category = cat.to_string();
                    stats.keyword_hits += 1;
                    continue;
                }
            }
            pending.push(idx);
        }

        // 3. AI batches
        if let Some(chat) = self.chat.as_deref().filter(|_| !pending.is_empty() && cfg.should_use_ai(source)) {
            self.run_ai_stage(chat, &mut items, &pending, source, cfg, &mut stats).await;
        }

        // 4. keyword-filtered + category allow/deny
        let before = items.len();
        items.retain(|it| it.category != CATEGORY_FILTERED);
        stats.keyword_filtered = before - items.len();

        let before = items.len();
        items = categories::apply_category_filter(items, &strategy);
        stats.category_filtered = before - items.len();

        // 5. script
        if strategy.uses_script() {
            let before = items.len();
            match script::filter_items(items.clone(), &strategy.script_filter_content, cfg.ai_classify.timeout()).await {
                Ok(kept) => {
                    stats.script_filtered = before - kept.len();
                    items = kept;
                }
                Err(e) => {
                    tracing::warn!(target: "classify", source = %source.url, error = %e, "script filter failed; keeping items");
                    stats.script_error = Some(format!("{e:#}"));
                }
            }
        }

        if stats.ai_classified > 0 || stats.ai_failed > 0 {
            tracing::info!(
                target: "classify",
                source = %source.url,
                classified = stats.ai_classified,
                failed = stats.ai_failed,
                cache_hits = stats.cache_hits,
                "classification finished"
            );
        }
        ClassifyOutcome { items, stats }
    }

    async fn run_ai_stage(
        &self,
        chat: &dyn ChatClient,
        items: &mut [Item],
        pending: &[usize],
        source: &Source,
        cfg: &Config,
        stats: &mut ClassifyStats,
    ) {
        let strategy = source.classify.clone().unwrap_or_default();
        let ai = &cfg.ai_classify;
        let taxonomy = categories::taxonomy_for(cfg, &strategy, &source.url);
        if taxonomy.is_empty() {
            tracing::warn!(target: "classify", source = %source.url, "no categories configured; skipping AI classification");
            return;
        }

        let batches: Vec<(Vec<usize>, ai_adapter::ChatRequest)> = pending
            .chunks(ai.batch_size())
            .map(|chunk| {
                let refs: Vec<(usize, &Item)> = chunk.iter().map(|&i| (i, &items[i])).collect();
                (chunk.to_vec(), build_batch_request(&refs, &taxonomy, ai, &strategy))
            })
            .collect();
        stats.ai_batches = batches.len();

        let attempts = ai.attempts();
        let wait = ai.retry_wait();
        let mut results = stream::iter(batches)
            .map(|(indices, req)| async move {
                let res = classify_batch_with_retry(chat, &req, attempts, wait).await;
                (indices, res)
            })
            .buffer_unordered(ai.concurrency());

        while let Some((indices, res)) = results.next().await {
            counter!("classify_ai_batches_total").increment(1);
            let map = match res {
                Ok(map) => map,
                Err(e) => {
                    let msg = format!("{e:#}");
                    counter!("classify_ai_batch_failures_total").increment(1);
                    counter!("classify_failed_items_total").increment(indices.len() as u64);
                    tracing::warn!(target: "classify", source = %source.url, items = indices.len(), error = %msg, "batch left unclassified");
                    stats.ai_failed += indices.len();
                    continue;
                }
            };
            let mut resolved = Vec::with_capacity(indices.len());
            for idx in indices {
                match map.get(&idx.to_string()) {
                    Some(cat) => {
                        items[idx].category = cat.clone();
                        stats.ai_classified += 1;
                        if !cat.is_empty() {
                            resolved.push((items[idx].link.clone(), cat.clone()));
                        }
                    }
                    None => {
                        counter!("classify_failed_items_total").increment(1);
                        stats.ai_failed += 1;
                    }
                }
            }
            self.caches.classify.insert_many(resolved);
        }
    }
}
