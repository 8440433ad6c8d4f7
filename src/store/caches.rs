// src/store/caches.rs
//! In-memory caches mirrored to a [`DurableStore`].
//!
//! Every mutation updates memory synchronously and schedules a write-behind
//! task for the touched keys. Write-behind tasks of one cache run one at a
//! time and copy the in-memory state of their keys as of when they run, so a
//! later task always carries the latest value or deletion. The periodic flush
//! replaces each durable table with memory and repairs anything a failed or
//! skipped write-behind left behind.

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{DurableStore, Table};
use crate::ingest::types::{now_secs, PostProcessEntry, RetainedItem};

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

type Map<V> = Arc<RwLock<HashMap<String, V>>>;

fn read_map<V>(map: &RwLock<HashMap<String, V>>) -> RwLockReadGuard<'_, HashMap<String, V>> {
    match map.read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn encode<V: Serialize>(table: Table, key: &str, v: &V) -> Option<Value> {
    match serde_json::to_value(v) {
        Ok(val) => Some(val),
        Err(e) => {
            tracing::warn!(target: "store", table = table.name(), key = %key, error = %e, "value not serializable");
            None
        }
    }
}

/// One link- or URL-keyed map with its durable mirror.
pub struct MirroredCache<V> {
    table: Table,
    map: Map<V>,
    store: Arc<dyn DurableStore>,
    dirty: Arc<AtomicBool>,
    /// Orders write-behind tasks and flushes of this cache.
    sync_gate: Arc<tokio::sync::Mutex<()>>,
}

impl<V> MirroredCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(table: Table, store: Arc<dyn DurableStore>, dirty: Arc<AtomicBool>) -> Self {
        Self {
            table,
            map: Arc::new(RwLock::new(HashMap::new())),
            store,
            dirty,
            sync_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, V>> {
        read_map(&self.map)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, V>> {
        match self.map.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> HashMap<String, V> {
        self.read().clone()
    }

    pub fn insert(&self, key: String, value: V) {
        self.insert_many(vec![(key, value)]);
    }

    pub fn insert_many(&self, entries: Vec<(String, V)>) {
        if entries.is_empty() {
            return;
        }
        let keys: Vec<String> = {
            let mut g = self.write();
            entries
                .into_iter()
                .map(|(k, v)| {
                    g.insert(k.clone(), v);
                    k
                })
                .collect()
        };
        self.schedule_sync(keys);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.remove_many([key.to_string()]) > 0
    }

    /// Remove the given keys; returns how many were present.
    pub fn remove_many(&self, keys: impl IntoIterator<Item = String>) -> usize {
        let removed: Vec<String> = {
            let mut g = self.write();
            keys.into_iter().filter(|k| g.remove(k).is_some()).collect()
        };
        self.persist_deletes(removed)
    }

    /// Drop every entry for which `keep` returns false; returns how many went.
    pub fn retain(&self, mut keep: impl FnMut(&str, &V) -> bool) -> usize {
        let removed: Vec<String> = {
            let mut g = self.write();
            let doomed: Vec<String> = g
                .iter()
                .filter(|(k, v)| !keep(k, v))
                .map(|(k, _)| k.clone())
                .collect();
            for k in &doomed {
                g.remove(k);
            }
            doomed
        };
        self.persist_deletes(removed)
    }

    pub fn clear(&self) -> usize {
        self.retain(|_, _| false)
    }

    fn persist_deletes(&self, removed: Vec<String>) -> usize {
        let n = removed.len();
        if n > 0 {
            self.schedule_sync(removed);
        }
        n
    }

    /// Mark dirty and spawn a write-behind task mirroring `keys`. Outside a
    /// runtime only the dirty flag is set; the next flush carries the change.
    fn schedule_sync(&self, keys: Vec<String>) {
        self.dirty.store(true, Ordering::Release);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let table = self.table;
        let map = self.map.clone();
        let store = self.store.clone();
        let dirty = self.dirty.clone();
        let gate = self.sync_gate.clone();
        handle.spawn(async move {
            let _gate = gate.lock().await;
            let (puts, deletes) = {
                let g = read_map(&map);
                let mut puts = Vec::new();
                let mut deletes = Vec::new();
                for k in keys {
                    match g.get(&k) {
                        Some(v) => {
                            if let Some(val) = encode(table, &k, v) {
                                puts.push((k, val));
                            }
                        }
                        None => deletes.push(k),
                    }
                }
                (puts, deletes)
            };
            let result = match store.put_batch(table, puts).await {
                Ok(()) => store.delete_batch(table, deletes).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                dirty.store(true, Ordering::Release);
                counter!("store_write_errors_total").increment(1);
                let msg = format!("{e:#}");
                tracing::warn!(target: "store", table = table.name(), error = %msg, "write-behind failed; next flush retries");
            }
        });
    }

    /// Mutate entries in memory only (derived fields that are not persisted).
    pub(crate) fn update_in_memory(&self, mut f: impl FnMut(&str, &mut V)) {
        let mut g = self.write();
        for (k, v) in g.iter_mut() {
            f(k, v);
        }
    }

    /// Replace memory with the durable table; undecodable rows are skipped.
    pub async fn load(&self) -> Result<usize> {
        let rows = self.store.load_all(self.table).await?;
        let mut decoded = HashMap::with_capacity(rows.len());
        for (k, raw) in rows {
            match serde_json::from_value::<V>(raw) {
                Ok(v) => {
                    decoded.insert(k, v);
                }
                Err(e) => {
                    tracing::warn!(target: "store", table = self.table.name(), key = %k, error = %e, "skipping undecodable row")
                }
            }
        }
        let n = decoded.len();
        *self.write() = decoded;
        Ok(n)
    }

    /// Replace the durable table with the in-memory map.
    pub async fn flush(&self) -> Result<()> {
        let _gate = self.sync_gate.lock().await;
        let entries: Vec<(String, Value)> = self
            .snapshot()
            .into_iter()
            .filter_map(|(k, v)| encode(self.table, &k, &v).map(|val| (k, val)))
            .collect();
        self.store.replace_table(self.table, entries).await
    }
}

/// The four caches sharing one dirty flag.
pub struct CacheSet {
    /// link → category id
    pub classify: MirroredCache<String>,
    /// original link → rewritten fields
    pub post_process: MirroredCache<PostProcessEntry>,
    /// source URL → retained projection
    pub retained: MirroredCache<Vec<RetainedItem>>,
    /// link → read-at
    pub read_state: MirroredCache<DateTime<Utc>>,
    dirty: Arc<AtomicBool>,
}

impl CacheSet {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        Self {
            classify: MirroredCache::new(Table::Classify, store.clone(), dirty.clone()),
            post_process: MirroredCache::new(Table::PostProcess, store.clone(), dirty.clone()),
            retained: MirroredCache::new(Table::RetainedItems, store.clone(), dirty.clone()),
            read_state: MirroredCache::new(Table::ReadState, store, dirty.clone()),
            dirty,
        }
    }

    /// Load every table. Retained items get their category restored from the
    /// classification cache (by link, then by original link).
    pub async fn load(&self) -> Result<()> {
        let classify = self.classify.load().await?;
        let post = self.post_process.load().await?;
        let retained = self.retained.load().await?;
        let read = self.read_state.load().await?;

        let categories = self.classify.snapshot();
        self.retained.update_in_memory(|_, items| {
            for it in items.iter_mut().filter(|it| it.category.is_empty()) {
                let hit = categories.get(&it.link).or_else(|| {
                    it.original_link
                        .as_ref()
                        .and_then(|orig| categories.get(orig))
                });
                if let Some(cat) = hit {
                    it.category = cat.clone();
                }
            }
        });

        tracing::info!(target: "store", classify, post, retained, read, "caches loaded");
        Ok(())
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write all tables; the dirty flag is restored when any write fails.
    pub async fn flush_all(&self) -> Result<()> {
        self.dirty.store(false, Ordering::Release);
        let results = [
            self.classify.flush().await,
            self.post_process.flush().await,
            self.retained.flush().await,
            self.read_state.flush().await,
        ];
        if let Some(err) = results.into_iter().find_map(Result::err) {
            self.mark_dirty();
            return Err(err);
        }
        Ok(())
    }

    /// Flush only when something changed since the last flush.
    pub async fn flush_if_dirty(&self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.flush_all().await?;
        Ok(true)
    }

    pub fn spawn_flush_loop(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.flush_if_dirty().await {
                    Ok(true) => tracing::debug!(target: "store", "caches flushed"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(target: "store", error = ?e, "periodic flush failed"),
                }
            }
        })
    }

    // ---- read state ----

    pub fn mark_read(&self, link: &str) {
        if link.is_empty() {
            return;
        }
        self.read_state.insert(link.to_string(), now_secs());
    }

    pub fn mark_read_batch(&self, links: &[String]) -> usize {
        let now = now_secs();
        let unique: HashSet<&String> = links.iter().filter(|l| !l.is_empty()).collect();
        let entries: Vec<(String, DateTime<Utc>)> =
            unique.into_iter().map(|l| (l.clone(), now)).collect();
        let n = entries.len();
        self.read_state.insert_many(entries);
        n
    }

    pub fn mark_unread(&self, link: &str) -> bool {
        self.read_state.remove(link)
    }

    pub fn is_read(&self, link: &str) -> bool {
        self.read_state.contains(link)
    }

    pub fn read_state(&self) -> HashMap<String, DateTime<Utc>> {
        self.read_state.snapshot()
    }

    pub fn clear_read_state(&self) -> usize {
        self.read_state.clear()
    }
}
