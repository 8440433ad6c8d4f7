// src/analyze/response.rs
//! Decoding of model replies: JSON extraction from prose or code fences and
//! the ordered chain of accepted batch-classification shapes.

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;

/// Pull a JSON object/array out of a model reply.
///
/// Order: the whole (trimmed) text when already delimited, a fenced code
/// block, the widest `{..}` span, the widest `[..]` span.
pub fn extract_json(s: &str) -> Option<&str> {
    let s = s.trim();
    if (s.starts_with('{') && s.ends_with('}')) || (s.starts_with('[') && s.ends_with(']')) {
        return Some(s);
    }

    static RE_FENCE: OnceCell<Regex> = OnceCell::new();
    let re = RE_FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap());
    if let Some(inner) = re.captures(s).and_then(|c| c.get(1)) {
        return Some(inner.as_str().trim());
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (s.find(open), s.rfind(close)) {
            if end > start {
                return Some(&s[start..=end]);
            }
        }
    }
    None
}

/// Index → category map returned for one batch.
pub type BatchResults = HashMap<String, String>;

#[derive(Deserialize)]
struct Nested {
    results: HashMap<String, String>,
}

#[derive(Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    category: String,
}

#[derive(Deserialize)]
struct Legacy {
    results: HashMap<String, LegacyEntry>,
}

/// Accepted reply shapes, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchShape {
    /// `{"results": {"0": "tech"}}` (must be non-empty)
    Nested,
    /// `{"0": "tech"}`
    Bare,
    /// `{"results": {"0": {"category": "tech"}}}`
    Legacy,
}

impl BatchShape {
    pub const CHAIN: [BatchShape; 3] = [BatchShape::Nested, BatchShape::Bare, BatchShape::Legacy];

    fn decode(self, json: &str) -> Option<BatchResults> {
        match self {
            BatchShape::Nested => serde_json::from_str::<Nested>(json)
                .ok()
                .map(|n| n.results)
                .filter(|m| !m.is_empty()),
            BatchShape::Bare => serde_json::from_str::<BatchResults>(json).ok(),
            BatchShape::Legacy => serde_json::from_str::<Legacy>(json)
                .ok()
                .filter(|l| !l.results.is_empty())
                .map(|l| {
                    l.results
                        .into_iter()
                        .map(|(k, v)| (k, v.category))
                        .collect()
                }),
        }
    }
}

/// First decoder in the chain that accepts the reply wins.
pub fn parse_batch_response(content: &str) -> Result<(BatchShape, BatchResults)> {
    let json = extract_json(content).unwrap_or(content);
    for shape in BatchShape::CHAIN {
        if let Some(mut results) = shape.decode(json) {
            for v in results.values_mut() {
                *v = v.trim().to_string();
            }
            return Ok((shape, results));
        }
    }
    let preview: String = content.chars().take(200).collect();
    Err(anyhow!("unrecognized batch classification reply: {preview}"))
}
