// src/ingest/reconcile.rs
//! Pure steps of a feed update: change detection, timestamp reconciliation,
//! canonical ordering, retained-cache merge and the display marker.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

use crate::config::Source;
use crate::ingest::types::{FeedSnapshot, Item, LastUpdated, RawItem, RetainedItem};

/// Apply the source's max-items cap (0 = unlimited).
pub fn cap_items(mut items: Vec<RawItem>, max_items: usize) -> Vec<RawItem> {
    if max_items > 0 && items.len() > max_items {
        items.truncate(max_items);
    }
    items
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Same links and titles in the same order.
    Unchanged,
    Changed {
        /// At least one link absent from the previous full list.
        has_new_items: bool,
    },
}

/// Compare the capped upstream list against the previous snapshot's full lists.
pub fn detect_change(prev: &FeedSnapshot, items: &[RawItem]) -> Change {
    let old: HashSet<&str> = prev.all_item_links.iter().map(String::as_str).collect();
    if items.iter().any(|it| !old.contains(it.link.as_str())) {
        return Change::Changed {
            has_new_items: true,
        };
    }
    if items.len() != prev.all_item_links.len() || items.len() != prev.all_item_titles.len() {
        return Change::Changed {
            has_new_items: false,
        };
    }
    let same = items
        .iter()
        .zip(prev.all_item_links.iter().zip(&prev.all_item_titles))
        .all(|(it, (link, title))| &it.link == link && &it.title == title);
    if same {
        Change::Unchanged
    } else {
        Change::Changed {
            has_new_items: false,
        }
    }
}

/// How an item's publish timestamp is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    /// Synthetic decreasing timestamps in upstream order.
    Ranking,
    /// Pin the first-seen time; ignore feed-provided dates.
    FirstSeen,
    /// Feed date, else cached, else now.
    Normal,
}

impl TimestampMode {
    pub fn for_source(source: &Source) -> Self {
        if source.ranking_mode {
            TimestampMode::Ranking
        } else if source.ignore_original_pub_date {
            TimestampMode::FirstSeen
        } else {
            TimestampMode::Normal
        }
    }
}

/// Previously assigned timestamps, keyed by link.
#[derive(Debug, Default, Clone)]
pub struct StickyTimestamps {
    pub pub_dates: HashMap<String, DateTime<Utc>>,
    pub fetch_times: HashMap<String, DateTime<Utc>>,
}

impl StickyTimestamps {
    /// Snapshot items take priority over the retained cache.
    pub fn collect(prev: Option<&FeedSnapshot>, retained: Option<&[RetainedItem]>) -> Self {
        let mut out = Self::default();
        if let Some(prev) = prev {
            for it in &prev.items {
                out.pub_dates.insert(it.link.clone(), it.pub_date);
                out.fetch_times.insert(it.link.clone(), it.fetch_time);
            }
        }
        for r in retained.unwrap_or_default() {
            out.pub_dates.entry(r.link.clone()).or_insert(r.pub_date);
            out.fetch_times.entry(r.link.clone()).or_insert(r.fetch_time);
        }
        out
    }
}

/// Turn raw entries into items with reconciled timestamps.
pub fn reconcile_timestamps(
    raw: &[RawItem],
    mode: TimestampMode,
    sticky: &StickyTimestamps,
    now: DateTime<Utc>,
) -> Vec<Item> {
    raw.iter()
        .enumerate()
        .map(|(idx, it)| {
            let cached = sticky.pub_dates.get(&it.link).copied();
            let pub_date = match mode {
                TimestampMode::Ranking => now - Duration::seconds(idx as i64),
                TimestampMode::FirstSeen => cached.unwrap_or(now),
                TimestampMode::Normal => it.published.or(it.updated).or(cached).unwrap_or(now),
            };
            let fetch_time = sticky.fetch_times.get(&it.link).copied().unwrap_or(now);
            Item {
                title: it.title.clone(),
                link: it.link.clone(),
                original_link: None,
                description: it.description.clone(),
                pub_date,
                fetch_time,
                category: String::new(),
                original_index: idx,
            }
        })
        .collect()
}

/// Newest first; equal timestamps keep upstream order.
pub fn canonical_sort(items: &mut [Item]) {
    items.sort_by(|a, b| {
        b.pub_date
            .cmp(&a.pub_date)
            .then(a.original_index.cmp(&b.original_index))
    });
}

/// Rescan the canonically sorted list, replacing each entry by its pipeline
/// survivor (carrying the assigned category) and dropping the rest.
pub fn refilter(sorted: &[Item], mut passed: HashMap<String, Item>) -> Vec<Item> {
    sorted
        .iter()
        .filter_map(|it| passed.remove(&it.link))
        .collect()
}

/// Deduplicate `fresh` by link and backfill from `retained` up to `cap`.
/// Returns the merged display list and the projection to persist.
pub fn merge_with_retained(
    fresh: Vec<Item>,
    retained: &[RetainedItem],
    cap: usize,
) -> (Vec<Item>, Vec<RetainedItem>) {
    let mut seen: HashSet<String> = HashSet::with_capacity(fresh.len() + retained.len());
    let mut merged: Vec<Item> = Vec::with_capacity(cap.max(fresh.len()));
    for it in fresh {
        if !it.link.is_empty() && seen.insert(it.link.clone()) {
            merged.push(it);
        }
    }
    for r in retained {
        if merged.len() >= cap {
            break;
        }
        if !r.link.is_empty() && seen.insert(r.link.clone()) {
            merged.push(Item::from(r.clone()));
        }
    }
    merged.truncate(cap);
    let projection = merged.iter().map(RetainedItem::from).collect();
    (merged, projection)
}

/// Whether this update may move the display time. Only a source pinning
/// first-seen times keeps its previous value, and only when change detection
/// compared a non-empty list and found no new links.
pub fn should_update_display(source: &Source, compared: bool, has_new_items: bool) -> bool {
    !(source.ignore_original_pub_date && compared && !has_new_items)
}

/// "Last updated" = newest fetch time among final items. Without items, fall
/// back to `as_of`, except that a real previous value is kept when the display
/// time should not move.
pub fn display_time(
    items: &[Item],
    as_of: DateTime<Utc>,
    previous: Option<LastUpdated>,
    should_update_display: bool,
) -> LastUpdated {
    if let Some(newest) = items.iter().map(|it| it.fetch_time).max() {
        return LastUpdated::At(newest);
    }
    match previous {
        Some(prev @ LastUpdated::At(_)) if !should_update_display => prev,
        _ => LastUpdated::At(as_of),
    }
}
