// src/ingest/mod.rs
pub mod engine;
pub mod fetcher;
pub mod icon;
pub mod reconcile;
pub mod scheduler;
pub mod types;

use metrics::{describe_counter, describe_gauge};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("feed_fetches_total", "Feed fetch attempts.");
        describe_counter!("feed_fetch_errors_total", "Feed fetch or parse failures.");
        describe_counter!(
            "feed_updates_published_total",
            "Snapshots replaced after a changed or forced update."
        );
        describe_counter!("scheduler_dispatches_total", "Scheduled refreshes dispatched.");
        describe_counter!(
            "scheduler_abandoned_total",
            "Scheduled refreshes abandoned after exhausting retries."
        );
        describe_gauge!("scheduler_last_tick_ts", "Unix ts of the last scheduler tick.");
        describe_counter!("classify_ai_batches_total", "AI classification batches completed.");
        describe_counter!(
            "classify_ai_batch_failures_total",
            "AI batches that failed after all retries."
        );
        describe_counter!(
            "classify_failed_items_total",
            "Items left unclassified by the AI stage."
        );
        describe_counter!("gc_deleted_total", "Cache entries removed by garbage collection.");
        describe_counter!("store_write_errors_total", "Failed write-behind operations.");
    });
}
