// src/analyze/keywords.rs
use crate::config::ClassifyStrategy;
use crate::ingest::types::{CATEGORY_FILTERED, CATEGORY_KEEP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordVerdict {
    Keep,
    Filtered,
    /// No rule fired; later stages decide.
    Undecided,
}

impl KeywordVerdict {
    pub fn category(self) -> Option<&'static str> {
        match self {
            KeywordVerdict::Keep => Some(CATEGORY_KEEP),
            KeywordVerdict::Filtered => Some(CATEGORY_FILTERED),
            KeywordVerdict::Undecided => None,
        }
    }
}

/// Case-insensitive substring match over title and description.
/// Blank keywords never match.
fn matches_any(keywords: &[String], title_lc: &str, desc_lc: &str) -> bool {
    keywords.iter().any(|k| {
        let k = k.trim().to_lowercase();
        !k.is_empty() && (title_lc.contains(&k) || desc_lc.contains(&k))
    })
}

/// Keep keywords first; in whitelist mode a miss filters the item;
/// otherwise filter keywords are checked.
pub fn evaluate(strategy: &ClassifyStrategy, title: &str, description: &str) -> KeywordVerdict {
    let title_lc = title.to_lowercase();
    let desc_lc = description.to_lowercase();

    if matches_any(&strategy.keep_keywords, &title_lc, &desc_lc) {
        return KeywordVerdict::Keep;
    }
    if strategy.whitelist_mode {
        return KeywordVerdict::Filtered;
    }
    if matches_any(&strategy.filter_keywords, &title_lc, &desc_lc) {
        return KeywordVerdict::Filtered;
    }
    KeywordVerdict::Undecided
}
