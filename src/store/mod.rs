// src/store/mod.rs
//! Durable key/value tables behind the in-memory caches, plus the caches and
//! their garbage collection.

pub mod caches;
pub mod gc;

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use caches::{CacheSet, MirroredCache};

/// The four persisted tables. Keys are article links, except for
/// `RetainedItems` which is keyed by source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Classify,
    PostProcess,
    RetainedItems,
    ReadState,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Classify,
        Table::PostProcess,
        Table::RetainedItems,
        Table::ReadState,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Classify => "classify",
            Table::PostProcess => "post_process",
            Table::RetainedItems => "retained_items",
            Table::ReadState => "read_state",
        }
    }
}

/// Storage engine contract. Implementations must be safe to call from many
/// tasks at once; callers never hold in-memory locks across these calls.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync {
    async fn load_all(&self, table: Table) -> Result<HashMap<String, Value>>;
    async fn put_batch(&self, table: Table, entries: Vec<(String, Value)>) -> Result<()>;
    async fn delete_batch(&self, table: Table, keys: Vec<String>) -> Result<()>;
    /// Make `table` hold exactly `entries`; rows not listed are dropped.
    async fn replace_table(&self, table: Table, entries: Vec<(String, Value)>) -> Result<()>;

    async fn put(&self, table: Table, key: &str, value: Value) -> Result<()> {
        self.put_batch(table, vec![(key.to_string(), value)]).await
    }

    async fn delete(&self, table: Table, key: &str) -> Result<()> {
        self.delete_batch(table, vec![key.to_string()]).await
    }
}

/// Process-local store; used by tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of one table's current contents.
    pub fn table(&self, table: Table) -> HashMap<String, Value> {
        let g = match self.tables.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        g.get(&table).cloned().unwrap_or_default()
    }

    pub fn get(&self, table: Table, key: &str) -> Option<Value> {
        self.table(table).remove(key)
    }

    fn with_table<R>(&self, table: Table, f: impl FnOnce(&mut HashMap<String, Value>) -> R) -> R {
        let mut g = match self.tables.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(g.entry(table).or_default())
    }
}

#[async_trait::async_trait]
impl DurableStore for MemoryStore {
    async fn load_all(&self, table: Table) -> Result<HashMap<String, Value>> {
        Ok(self.table(table))
    }

    async fn put_batch(&self, table: Table, entries: Vec<(String, Value)>) -> Result<()> {
        self.with_table(table, |t| t.extend(entries));
        Ok(())
    }

    async fn replace_table(&self, table: Table, entries: Vec<(String, Value)>) -> Result<()> {
        self.with_table(table, |t| *t = entries.into_iter().collect());
        Ok(())
    }

    async fn delete_batch(&self, table: Table, keys: Vec<String>) -> Result<()> {
        self.with_table(table, |t| {
            for k in &keys {
                t.remove(k);
            }
        });
        Ok(())
    }
}

/// One pretty JSON document per table under a data directory. Every mutation
/// rewrites the table file atomically (tmp + rename).
pub struct JsonFileStore {
    dir: PathBuf,
    tables: Mutex<HashMap<Table, BTreeMap<String, Value>>>,
    /// Serializes file writes so a newer image is never overwritten by an older one.
    write_gate: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Open (creating the directory if needed) and read existing tables.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating data dir {}", dir.display()))?;
        let mut tables = HashMap::new();
        for table in Table::ALL {
            let path = Self::path_in(&dir, table);
            let map: BTreeMap<String, Value> = match std::fs::read_to_string(&path) {
                Ok(s) if !s.trim().is_empty() => serde_json::from_str(&s)
                    .with_context(|| format!("parsing {}", path.display()))?,
                Ok(_) => BTreeMap::new(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
                Err(e) => {
                    return Err(e).with_context(|| format!("reading {}", path.display()))
                }
            };
            tables.insert(table, map);
        }
        Ok(Self {
            dir,
            tables: Mutex::new(tables),
            write_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_in(dir: &Path, table: Table) -> PathBuf {
        dir.join(format!("{}.json", table.name()))
    }

    /// Apply `f` to the in-memory image and return the serialized result.
    fn mutate(
        &self,
        table: Table,
        f: impl FnOnce(&mut BTreeMap<String, Value>),
    ) -> Result<Vec<u8>> {
        let mut g = match self.tables.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let t = g.entry(table).or_default();
        f(t);
        serde_json::to_vec_pretty(t).context("serializing table")
    }

    async fn write(&self, table: Table, f: impl FnOnce(&mut BTreeMap<String, Value>)) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let bytes = self.mutate(table, f)?;
        let path = Self::path_in(&self.dir, table);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming onto {}", path.display()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DurableStore for JsonFileStore {
    async fn load_all(&self, table: Table) -> Result<HashMap<String, Value>> {
        let g = match self.tables.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(g.get(&table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn put_batch(&self, table: Table, entries: Vec<(String, Value)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.write(table, |t| t.extend(entries)).await
    }

    async fn replace_table(&self, table: Table, entries: Vec<(String, Value)>) -> Result<()> {
        self.write(table, |t| *t = entries.into_iter().collect()).await
    }

    async fn delete_batch(&self, table: Table, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.write(table, |t| {
            for k in &keys {
                t.remove(k);
            }
        })
        .await
    }
}
