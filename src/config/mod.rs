// src/config/mod.rs
//! Application configuration (`config.json`): sources, schedule windows,
//! folders, categories and the AI backend settings.
//!
//! Unknown keys (presentation settings such as layout groups) are carried
//! through `extra` so that saving the file back never drops them.

pub mod ai;
pub mod diff;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tempfile::NamedTempFile;

pub use ai::{AiClassifyConfig, CategoryPackage};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const ENV_CONFIG_PATH: &str = "CURATOR_CONFIG_PATH";

/// Resolve the config path: $CURATOR_CONFIG_PATH, else `config.json`.
pub fn config_path_from_env() -> PathBuf {
    std::env::var(ENV_CONFIG_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub color: String,
}

/// One time-of-day window of the refresh policy. Times are `HH:MM:SS`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleWindow {
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    /// Base refresh period in minutes.
    #[serde(default)]
    pub base_refresh: u32,
    #[serde(default)]
    pub default_count: u32,
}

/// Per-source keyword / AI / script classification settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifyStrategy {
    pub keyword_enabled: bool,
    pub ai_enabled: bool,
    pub filter_keywords: Vec<String>,
    /// Keep keywords win over filter keywords.
    pub keep_keywords: Vec<String>,
    /// Only items matching a keep keyword survive.
    pub whitelist_mode: bool,
    pub script_filter_enabled: bool,
    pub script_filter_content: String,
    /// Restricts the taxonomy sent to the model; empty = all categories.
    pub bound_categories: Vec<String>,
    pub category_blacklist: Vec<String>,
    /// Takes precedence over the blacklist.
    pub category_whitelist: Vec<String>,
    pub custom_prompt: String,
}

impl ClassifyStrategy {
    pub fn uses_keywords(&self) -> bool {
        self.keyword_enabled || self.whitelist_mode
    }

    pub fn uses_script(&self) -> bool {
        self.script_filter_enabled && !self.script_filter_content.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostProcessMode {
    #[default]
    Ai,
    Script,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostProcessConfig {
    pub enabled: bool,
    pub mode: PostProcessMode,
    pub prompt: String,
    pub script_path: String,
    /// Wins over `script_path` when both are set.
    pub script_content: String,
    pub modify_title: bool,
    pub modify_link: bool,
    pub modify_pub_date: bool,
}

/// Retained-items policy, stored as `cacheItems` (-1 disabled, 0 auto, N fixed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum RetainedPolicy {
    Disabled,
    /// Keep exactly what the current update produced.
    #[default]
    Auto,
    Fixed(usize),
}

impl From<i64> for RetainedPolicy {
    fn from(v: i64) -> Self {
        match v {
            v if v < 0 => RetainedPolicy::Disabled,
            0 => RetainedPolicy::Auto,
            n => RetainedPolicy::Fixed(n as usize),
        }
    }
}

impl From<RetainedPolicy> for i64 {
    fn from(p: RetainedPolicy) -> Self {
        match p {
            RetainedPolicy::Disabled => -1,
            RetainedPolicy::Auto => 0,
            RetainedPolicy::Fixed(n) => n as i64,
        }
    }
}

impl RetainedPolicy {
    /// Effective cap for a freshly produced list of `produced` items.
    pub fn cap(self, produced: usize) -> Option<usize> {
        match self {
            RetainedPolicy::Disabled => None,
            RetainedPolicy::Auto => Some(produced),
            RetainedPolicy::Fixed(n) => Some(n),
        }
    }
}

/// One configured feed. Identity is `url`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classify: Option<ClassifyStrategy>,
    #[serde(default)]
    pub ignore_original_pub_date: bool,
    #[serde(default)]
    pub ranking_mode: bool,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_items: usize,
    #[serde(default, rename = "cacheItems")]
    pub cache_items: RetainedPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process: Option<PostProcessConfig>,
    /// Multiplier of the matching window's base refresh; 0 = window default.
    #[serde(default)]
    pub refresh_count: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Source {
    pub fn post_process_enabled(&self) -> bool {
        self.post_process.as_ref().is_some_and(|p| p.enabled)
    }

    pub fn ai_enabled(&self) -> bool {
        self.classify.as_ref().is_some_and(|c| c.ai_enabled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category_package_id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entries: Vec<FolderEntry>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub schedules: Vec<ScheduleWindow>,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub ai_classify: AiClassifyConfig,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Config {
    /// Load from an explicit path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_json_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Async variant of [`Config::load_from_file`] for use on the runtime.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_json_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let mut cfg: Config = serde_json::from_str(s)?;
        cfg.ai_classify.resolve_env();
        Ok(cfg)
    }

    /// Write the config back atomically through a uniquely named temp file
    /// in the same directory. Blocking.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serializing config")?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        tmp.write_all(&json).context("writing config")?;
        tmp.as_file().sync_all().context("syncing config")?;
        tmp.persist(path)
            .with_context(|| format!("renaming onto {}", path.display()))?;
        Ok(())
    }

    pub fn source(&self, url: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.url == url)
    }

    pub fn urls(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|s| !s.url.is_empty())
            .map(|s| s.url.clone())
            .collect()
    }

    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.id == id)
    }

    /// AI-enabled sources whose bound categories intersect the package.
    pub fn sources_in_package(&self, package_id: &str) -> Vec<&Source> {
        let Some(pkg) = self
            .ai_classify
            .category_packages
            .iter()
            .find(|p| p.id == package_id)
        else {
            return Vec::new();
        };
        self.sources
            .iter()
            .filter(|s| s.ai_enabled())
            .filter(|s| {
                s.classify.as_ref().is_some_and(|c| {
                    c.bound_categories
                        .iter()
                        .any(|b| pkg.categories.iter().any(|cat| &cat.id == b))
                })
            })
            .collect()
    }

    /// Source URLs a folder expands to, in entry order (duplicates removed).
    pub fn folder_source_urls(&self, folder: &Folder) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for entry in &folder.entries {
            if !entry.category_package_id.is_empty() {
                for s in self.sources_in_package(&entry.category_package_id) {
                    if !out.contains(&s.url) {
                        out.push(s.url.clone());
                    }
                }
            } else if !entry.source_url.is_empty() && !out.contains(&entry.source_url) {
                out.push(entry.source_url.clone());
            }
        }
        out
    }

    /// Whether any classification stage is active for this source.
    pub fn should_filter(&self, source: &Source) -> bool {
        let Some(strategy) = &source.classify else {
            return false;
        };
        strategy.keyword_enabled
            || strategy.script_filter_enabled
            || (strategy.ai_enabled && self.ai_classify.is_usable())
    }

    pub fn should_use_ai(&self, source: &Source) -> bool {
        source.ai_enabled() && self.ai_classify.is_usable()
    }
}

/// Shared, swappable configuration. Readers clone the inner `Arc` and never
/// hold the lock across I/O.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
    path: Option<PathBuf>,
    /// One save at a time; each save writes the config current at that moment.
    save_gate: Arc<tokio::sync::Mutex<()>>,
}

impl ConfigHandle {
    pub fn new(cfg: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(cfg))),
            path: None,
            save_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// A handle that persists changes back to `path`.
    pub fn with_path(cfg: Config, path: PathBuf) -> Self {
        Self {
            path: Some(path),
            ..Self::new(cfg)
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn current(&self) -> Arc<Config> {
        match self.inner.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new config, returning the previous one.
    pub fn replace(&self, cfg: Config) -> Arc<Config> {
        let mut g = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *g, Arc::new(cfg))
    }

    /// Give a nameless source the parsed feed title. First write wins: a name
    /// set in the meantime is never overwritten. Returns true when adopted.
    pub async fn adopt_source_name(&self, url: &str, title: &str) -> bool {
        if title.is_empty() {
            return false;
        }
        let adopted = {
            let mut g = match self.inner.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match g.sources.iter().position(|s| s.url == url && s.name.is_empty()) {
                Some(idx) => {
                    let mut next = (**g).clone();
                    next.sources[idx].name = title.to_string();
                    *g = Arc::new(next);
                    true
                }
                None => false,
            }
        };
        if !adopted {
            return false;
        }
        if let Some(path) = &self.path {
            match self.save(path.clone()).await {
                Ok(()) => tracing::info!(target: "config", source = %url, name = %title, "adopted feed title as source name"),
                Err(e) => {
                    let msg = format!("{e:#}");
                    tracing::warn!(target: "config", source = %url, error = %msg, "saving adopted source name failed");
                }
            }
        }
        true
    }

    /// Persist the current config on the blocking pool, serialized with other saves.
    async fn save(&self, path: PathBuf) -> Result<()> {
        let _gate = self.save_gate.lock().await;
        let cfg = self.current();
        tokio::task::spawn_blocking(move || cfg.save_to_file(&path))
            .await
            .context("config save task")?
    }
}
