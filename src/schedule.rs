// src/schedule.rs
//! Time-of-day refresh policy: maps the current time and a source's refresh
//! multiplier to a refresh interval using the configured schedule windows.

use chrono::NaiveTime;

use crate::config::ScheduleWindow;

/// Outcome of evaluating the schedule windows for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveInterval {
    /// Minutes between refreshes; 0 means "do not refresh now".
    pub minutes: u32,
    /// Index into the configured window list of the window that matched.
    pub window: Option<usize>,
}

impl EffectiveInterval {
    pub fn none() -> Self {
        Self {
            minutes: 0,
            window: None,
        }
    }

    pub fn as_duration(&self) -> Option<chrono::Duration> {
        (self.minutes > 0).then(|| chrono::Duration::minutes(i64::from(self.minutes)))
    }
}

fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// Parsed `[start, end]` of a window, or `None` for degenerate windows
/// (empty, unparseable or equal bounds).
pub fn window_bounds(w: &ScheduleWindow) -> Option<(NaiveTime, NaiveTime)> {
    let start = parse_time_of_day(&w.start_time)?;
    let end = parse_time_of_day(&w.end_time)?;
    (start != end).then_some((start, end))
}

/// Inclusive match; windows with `start > end` wrap past midnight.
pub fn window_matches(w: &ScheduleWindow, t: NaiveTime) -> bool {
    match window_bounds(w) {
        Some((start, end)) if start < end => t >= start && t <= end,
        Some((start, end)) => t >= start || t <= end,
        None => false,
    }
}

/// First matching window wins. The multiplier is the source's own refresh
/// count when positive, else the window's default count.
pub fn effective_interval(
    windows: &[ScheduleWindow],
    refresh_count: u32,
    now: NaiveTime,
) -> EffectiveInterval {
    for (idx, w) in windows.iter().enumerate() {
        if !window_matches(w, now) {
            continue;
        }
        let count = if refresh_count > 0 {
            refresh_count
        } else {
            w.default_count
        };
        return EffectiveInterval {
            minutes: w.base_refresh.saturating_mul(count),
            window: Some(idx),
        };
    }
    EffectiveInterval::none()
}
