// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use super::Category;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";

/// A named bundle of categories; folders can reference a package instead of a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPackage {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub categories: Vec<Category>,
}

/// Global settings of the AI classification backend (`aiClassify` in config.json).
/// Zero/absent numeric fields fall back to the defaults exposed by the getters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiClassifyConfig {
    pub enabled: bool,
    /// "ENV" means: read from OPENAI_API_KEY
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Request timeout in seconds; also bounds the script filter.
    pub timeout: u64,
    pub concurrency: usize,
    pub max_desc_length: usize,
    pub batch_size: usize,
    /// 0 = default (3), negative = no attempts beyond the first.
    pub retry_count: i32,
    pub retry_wait: u64,
    pub category_packages: Vec<CategoryPackage>,
    /// Key read from the environment when `api_key` is "ENV". Never serialized.
    #[serde(skip)]
    env_api_key: Option<String>,
}

impl AiClassifyConfig {
    /// Resolve `apiKey: "ENV"` against the process environment.
    /// A missing variable leaves the key empty, which disables AI classification.
    /// The configured value stays untouched so saving the file keeps "ENV".
    pub fn resolve_env(&mut self) {
        if self.key_from_env() {
            let key = env::var(ENV_OPENAI_API_KEY).unwrap_or_default();
            if key.is_empty() {
                tracing::warn!(target: "config", "aiClassify.apiKey is ENV but {ENV_OPENAI_API_KEY} is unset");
            }
            self.env_api_key = Some(key);
        }
    }

    fn key_from_env(&self) -> bool {
        self.api_key.trim().eq_ignore_ascii_case("env")
    }

    /// Key sent to the backend: the environment value for "ENV", else the literal.
    pub fn effective_api_key(&self) -> &str {
        if self.key_from_env() {
            self.env_api_key.as_deref().unwrap_or_default()
        } else {
            &self.api_key
        }
    }

    /// AI is usable only when globally enabled and a key is present.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.effective_api_key().is_empty()
    }

    pub fn api_base(&self) -> &str {
        if self.api_base.is_empty() {
            DEFAULT_API_BASE
        } else {
            self.api_base.trim_end_matches('/')
        }
    }

    pub fn model(&self) -> &str {
        if self.model.is_empty() {
            DEFAULT_MODEL
        } else {
            &self.model
        }
    }

    pub fn max_tokens(&self) -> u32 {
        if self.max_tokens == 0 {
            500
        } else {
            self.max_tokens
        }
    }

    pub fn temperature(&self) -> f64 {
        if self.temperature == 0.0 {
            0.1
        } else {
            self.temperature
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(if self.timeout == 0 { 30 } else { self.timeout })
    }

    pub fn concurrency(&self) -> usize {
        if self.concurrency == 0 {
            5
        } else {
            self.concurrency
        }
    }

    pub fn max_desc_length(&self) -> usize {
        if self.max_desc_length == 0 {
            2000
        } else {
            self.max_desc_length
        }
    }

    pub fn batch_size(&self) -> usize {
        if self.batch_size == 0 {
            5
        } else {
            self.batch_size
        }
    }

    /// Total attempts per batch (first call included).
    pub fn attempts(&self) -> u32 {
        match self.retry_count {
            n if n < 0 => 1,
            0 => 3,
            n => n as u32,
        }
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(if self.retry_wait == 0 { 2 } else { self.retry_wait })
    }

    /// Union of package categories, or the global list when no packages exist.
    pub fn categories(&self, global: &[Category]) -> Vec<Category> {
        if self.category_packages.is_empty() {
            return global.to_vec();
        }
        self.category_packages
            .iter()
            .flat_map(|p| p.categories.iter().cloned())
            .collect()
    }
}
