// tests/scheduler.rs
//
// Dispatch decisions of the refresh scheduler: due detection against the
// schedule windows, dispatch-time bookkeeping, next-update display and the
// fixed-delay retry of failed fetches.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use common::*;
use rss_curator::config::ScheduleWindow;
use rss_curator::ingest::scheduler::RefreshScheduler;

const A: &str = "https://a.test/rss";
const B: &str = "https://b.test/rss";

fn daytime() -> ScheduleWindow {
    ScheduleWindow {
        start_time: "08:00:00".into(),
        end_time: "23:00:00".into(),
        base_refresh: 10,
        default_count: 1,
    }
}

fn at(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn scheduler_for(h: &Harness) -> Arc<RefreshScheduler> {
    Arc::new(RefreshScheduler::new(h.engine.clone()).with_retry_delay(Duration::from_millis(5)))
}

#[tokio::test]
async fn due_sources_dispatch_once_per_interval() {
    let mut slow = source(B);
    slow.refresh_count = 3;
    let mut cfg = ai_config(vec![source(A), slow]);
    cfg.schedules = vec![daytime()];
    let h = harness(cfg, None);
    h.fetcher.set(A, "A", vec![raw("https://a.test/1", "one")]);
    h.fetcher.set(B, "B", vec![raw("https://b.test/1", "one")]);
    let sched = scheduler_for(&h);

    let mut due = sched.tick_at(ts(9, 0), at(9, 0));
    due.sort();
    assert_eq!(due, vec![A.to_string(), B.to_string()]);
    assert_eq!(sched.last_dispatch(A), Some(ts(9, 0)));
    // Earliest next due: A after 10 minutes (B waits 30).
    assert_eq!(sched.next_global_update(), Some(ts(9, 10)));

    assert!(sched.tick_at(ts(9, 5), at(9, 5)).is_empty());
    assert_eq!(sched.tick_at(ts(9, 10), at(9, 10)), vec![A.to_string()]);
    assert!(sched.tick_at(ts(9, 20), at(9, 20)).contains(&A.to_string()));
    let due = sched.tick_at(ts(9, 30), at(9, 30));
    assert!(due.contains(&A.to_string()) && due.contains(&B.to_string()));

    let engine = h.engine.clone();
    assert!(eventually(|| engine.snapshot(A).is_some() && engine.snapshot(B).is_some()).await);
}

#[tokio::test]
async fn sources_outside_every_window_are_not_dispatched() {
    let mut cfg = ai_config(vec![source(A)]);
    cfg.schedules = vec![daytime()];
    let h = harness(cfg, None);
    let sched = scheduler_for(&h);

    assert!(sched.tick_at(ts(3, 0), at(3, 0)).is_empty());
    assert_eq!(sched.next_global_update(), None);
    assert_eq!(sched.last_dispatch(A), None);
}

#[tokio::test]
async fn overnight_window_wraps_midnight() {
    let mut cfg = ai_config(vec![source(A)]);
    cfg.schedules = vec![ScheduleWindow {
        start_time: "22:00:00".into(),
        end_time: "06:00:00".into(),
        base_refresh: 60,
        default_count: 1,
    }];
    let h = harness(cfg, None);
    h.fetcher.set(A, "A", Vec::new());
    let sched = scheduler_for(&h);

    assert!(sched.tick_at(ts(12, 0), at(12, 0)).is_empty());
    assert_eq!(sched.tick_at(ts(12, 1), at(2, 0)), vec![A.to_string()]);
}

#[tokio::test]
async fn failed_fetches_are_retried_with_fixed_delay() {
    let mut cfg = ai_config(vec![source(A)]);
    cfg.schedules = vec![daytime()];
    let h = harness(cfg, None);
    h.fetcher.set(A, "A", vec![raw("https://a.test/1", "one")]);
    h.fetcher.fail_next(A, 2);
    let sched = scheduler_for(&h);

    sched.tick_at(ts(9, 0), at(9, 0));
    let engine = h.engine.clone();
    assert!(eventually(|| engine.snapshot(A).is_some()).await);
    assert_eq!(h.fetcher.calls(), 3);
}

#[tokio::test]
async fn retries_stop_after_three_attempts() {
    let mut cfg = ai_config(vec![source(A)]);
    cfg.schedules = vec![daytime()];
    let h = harness(cfg, None);
    h.fetcher.fail_next(A, 10);
    let sched = scheduler_for(&h);

    sched.tick_at(ts(9, 0), at(9, 0));
    let fetcher = h.fetcher.clone();
    assert!(eventually(|| fetcher.calls() == 3).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.fetcher.calls(), 3);
    assert!(h.engine.snapshot(A).is_none());
}
