// src/analyze/categories.rs
use std::collections::HashSet;

use crate::config::{Category, ClassifyStrategy, Config};
use crate::ingest::types::{Item, CATEGORY_KEEP};

/// Categories offered to the model for one source: the configured taxonomy,
/// narrowed to the source's bound categories when any of them exist.
pub fn taxonomy_for(cfg: &Config, strategy: &ClassifyStrategy, source_url: &str) -> Vec<Category> {
    let all = cfg.ai_classify.categories(&cfg.categories);
    if strategy.bound_categories.is_empty() {
        return all;
    }
    let bound: HashSet<&str> = strategy.bound_categories.iter().map(String::as_str).collect();
    let narrowed: Vec<Category> = all
        .iter()
        .filter(|c| bound.contains(c.id.as_str()))
        .cloned()
        .collect();
    if narrowed.is_empty() {
        tracing::warn!(target: "classify", source = %source_url, "bound categories match nothing; using the full taxonomy");
        return all;
    }
    narrowed
}

/// Whitelist wins over blacklist; `_keep` items always pass.
pub fn apply_category_filter(items: Vec<Item>, strategy: &ClassifyStrategy) -> Vec<Item> {
    if strategy.category_whitelist.is_empty() && strategy.category_blacklist.is_empty() {
        return items;
    }
    let white: HashSet<&str> = strategy.category_whitelist.iter().map(String::as_str).collect();
    let black: HashSet<&str> = strategy.category_blacklist.iter().map(String::as_str).collect();
    items
        .into_iter()
        .filter(|it| {
            if it.category == CATEGORY_KEEP {
                return true;
            }
            if !white.is_empty() {
                return white.contains(it.category.as_str());
            }
            !black.contains(it.category.as_str())
        })
        .collect()
}
