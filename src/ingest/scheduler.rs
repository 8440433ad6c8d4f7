// src/ingest/scheduler.rs
//! Polling refresh scheduler: every tick, dispatch the sources whose
//! effective interval has elapsed since their last dispatch.

use chrono::{DateTime, Local, NaiveTime, Utc};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::ingest::engine::{is_not_found, Engine, UpdateMode};
use crate::ingest::types::now_secs;
use crate::schedule::effective_interval;

pub const TICK_INTERVAL: Duration = Duration::from_secs(10);
pub const FETCH_ATTEMPTS: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Default)]
struct State {
    last_dispatch: HashMap<String, DateTime<Utc>>,
    next_global_update: Option<DateTime<Utc>>,
}

pub struct RefreshScheduler {
    engine: Arc<Engine>,
    state: RwLock<State>,
    retry_delay: Duration,
}

impl RefreshScheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            state: RwLock::new(State::default()),
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut g = match self.state.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut g)
    }

    pub fn last_dispatch(&self, url: &str) -> Option<DateTime<Utc>> {
        self.with_state(|s| s.last_dispatch.get(url).copied())
    }

    /// Earliest next-due time over all sources, as of the last tick. Display only.
    pub fn next_global_update(&self) -> Option<DateTime<Utc>> {
        self.with_state(|s| s.next_global_update)
    }

    /// Tick using the local wall-clock time of day for window matching.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        self.tick_at(now, now.with_timezone(&Local).time())
    }

    /// Evaluate every source and dispatch the due ones. Dispatch time is
    /// recorded before the update runs. Returns the dispatched URLs.
    pub fn tick_at(&self, now: DateTime<Utc>, time_of_day: NaiveTime) -> Vec<String> {
        let cfg = self.engine.config().current();
        let due = self.with_state(|state| {
            let mut due = Vec::new();
            let mut next: Option<DateTime<Utc>> = None;
            for source in cfg.sources.iter().filter(|s| !s.url.is_empty()) {
                let Some(interval) =
                    effective_interval(&cfg.schedules, source.refresh_count, time_of_day).as_duration()
                else {
                    continue;
                };
                let next_due = match state.last_dispatch.get(&source.url) {
                    Some(last) if now - *last < interval => *last + interval,
                    _ => {
                        state.last_dispatch.insert(source.url.clone(), now);
                        due.push(source.url.clone());
                        now + interval
                    }
                };
                next = Some(next.map_or(next_due, |n| n.min(next_due)));
            }
            state.next_global_update = next;
            due
        });

        gauge!("scheduler_last_tick_ts").set(now.timestamp() as f64);
        for url in &due {
            counter!("scheduler_dispatches_total").increment(1);
            let engine = self.engine.clone();
            let url = url.clone();
            let delay = self.retry_delay;
            tokio::spawn(async move {
                dispatch(engine, url, delay).await;
            });
        }
        if !due.is_empty() {
            tracing::debug!(target: "scheduler", due = due.len(), "dispatched refreshes");
        }
        due
    }

    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.tick(now_secs());
            }
        })
    }
}

/// Run one scheduled update with fixed-delay retries.
async fn dispatch(engine: Arc<Engine>, url: String, delay: Duration) {
    for attempt in 1..=FETCH_ATTEMPTS {
        match engine.update(&url, now_secs(), UpdateMode::SCHEDULED).await {
            Ok(_) => return,
            Err(e) if is_not_found(&e) => {
                tracing::debug!(target: "scheduler", source = %url, "source removed before dispatch ran");
                return;
            }
            Err(e) => {
                let msg = format!("{e:#}");
                tracing::warn!(target: "scheduler", source = %url, attempt, error = %msg, "refresh failed");
                if attempt < FETCH_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    counter!("scheduler_abandoned_total").increment(1);
    tracing::error!(target: "scheduler", source = %url, attempts = FETCH_ATTEMPTS, "giving up until next due cycle");
}
