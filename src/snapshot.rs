// src/snapshot.rs
//! Published per-source snapshots. Writers replace a whole entry under one
//! short write lock; readers get a cheap `Arc` clone.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::ingest::types::{FeedSnapshot, LastUpdated};

#[derive(Clone, Default)]
pub struct SnapshotStore {
    inner: Arc<RwLock<HashMap<String, Arc<FeedSnapshot>>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<FeedSnapshot>>> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<FeedSnapshot>>> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, url: &str) -> Option<Arc<FeedSnapshot>> {
        self.read().get(url).cloned()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.read().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn all(&self) -> Vec<(String, Arc<FeedSnapshot>)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replace the entry for `url`, returning the previous snapshot.
    pub fn publish(&self, url: &str, snapshot: FeedSnapshot) -> Option<Arc<FeedSnapshot>> {
        self.write().insert(url.to_string(), Arc::new(snapshot))
    }

    /// Insert only when nothing is published yet (startup warm-up).
    pub fn seed(&self, url: &str, snapshot: FeedSnapshot) -> bool {
        let mut g = self.write();
        if g.contains_key(url) {
            return false;
        }
        g.insert(url.to_string(), Arc::new(snapshot));
        true
    }

    /// Swap a placeholder display marker for a real time. Returns true if
    /// the snapshot changed.
    pub fn confirm_placeholder(&self, url: &str, at: DateTime<Utc>) -> bool {
        let mut g = self.write();
        let Some(current) = g.get(url) else {
            return false;
        };
        if !current.last_updated.is_placeholder() {
            return false;
        }
        let mut next = (**current).clone();
        next.last_updated = LastUpdated::At(at);
        g.insert(url.to_string(), Arc::new(next));
        true
    }

    pub fn remove(&self, url: &str) -> Option<Arc<FeedSnapshot>> {
        self.write().remove(url)
    }
}
