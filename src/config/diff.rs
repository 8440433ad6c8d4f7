// src/config/diff.rs
//! Which sources need a forced reprocess after a config reload.

use std::collections::{BTreeSet, HashMap};

use super::{ClassifyStrategy, Config, PostProcessConfig, RetainedPolicy, Source};

/// The subset of a source's settings that changes fetched or cached content.
/// Display-only fields (name, icon, refresh count, presentation flags) are
/// absent.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheAffectingFields<'a> {
    pub max_items: usize,
    pub cache_items: RetainedPolicy,
    pub ignore_original_pub_date: bool,
    pub ranking_mode: bool,
    pub classify: Option<&'a ClassifyStrategy>,
    pub post_process: Option<&'a PostProcessConfig>,
}

impl<'a> From<&'a Source> for CacheAffectingFields<'a> {
    fn from(s: &'a Source) -> Self {
        Self {
            max_items: s.max_items,
            cache_items: s.cache_items,
            ignore_original_pub_date: s.ignore_original_pub_date,
            ranking_mode: s.ranking_mode,
            classify: s.classify.as_ref(),
            post_process: s.post_process.as_ref(),
        }
    }
}

pub fn source_changed(old: &Source, new: &Source) -> bool {
    CacheAffectingFields::from(old) != CacheAffectingFields::from(new)
}

/// New sources plus sources whose cache-affecting fields changed.
pub fn affected_sources(old: &Config, new: &Config) -> BTreeSet<String> {
    let previous: HashMap<&str, &Source> = old
        .sources
        .iter()
        .filter(|s| !s.url.is_empty())
        .map(|s| (s.url.as_str(), s))
        .collect();

    new.sources
        .iter()
        .filter(|s| !s.url.is_empty())
        .filter(|s| match previous.get(s.url.as_str()) {
            None => true,
            Some(prev) => source_changed(prev, s),
        })
        .map(|s| s.url.clone())
        .collect()
}
