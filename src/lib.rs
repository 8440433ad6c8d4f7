// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod analyze;
pub mod api;
pub mod app;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod postprocess;
pub mod schedule;
pub mod snapshot;
pub mod store;
pub mod watcher;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::config::{Config, ConfigHandle};
pub use crate::ingest::engine::{Engine, UpdateMode, UpdateOutcome};
pub use crate::ingest::types::{FeedFetcher, FeedSnapshot, Item};
pub use crate::snapshot::SnapshotStore;
pub use crate::store::CacheSet;
