//! Quota manager — per-channel daily and hourly send caps with warm-up ramp.
//!
//! Counters are keyed by messaging-channel id, so jobs sharing a channel
//! share one budget. `try_reserve` checks and consumes a slot in one step.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Days, NaiveDate, NaiveDateTime, Timelike};
use outreach_core::config::DispatchConfig;
use serde::Serialize;

/// `ceil(daily_limit * warmup_day * increment / 100)`, clamped to `daily_limit`.
/// Warm-up days are numbered from 1.
pub fn effective_daily_limit(config: &DispatchConfig, warmup_day: u32) -> u32 {
    if !config.warmup_enabled {
        return config.daily_limit;
    }
    let day = u64::from(warmup_day.max(1));
    let scaled = (u64::from(config.daily_limit) * day * u64::from(config.warmup_increment_percent))
        .div_ceil(100);
    scaled.min(u64::from(config.daily_limit)) as u32
}

/// Caps in force for one job at one moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    pub daily: u32,
    pub hourly: u32,
}

impl QuotaLimits {
    /// Limits for a job; the warm-up day advances with each local day since
    /// the job started.
    pub fn for_job(config: &DispatchConfig, started_on: Option<NaiveDate>, today: NaiveDate) -> Self {
        let elapsed = started_on
            .map(|d| (today - d).num_days().max(0) as u32)
            .unwrap_or(0);
        Self {
            daily: effective_daily_limit(config, config.warmup_day.saturating_add(elapsed)),
            hourly: config.messages_per_hour,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    Daily,
    Hourly,
}

/// Result of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Granted,
    /// Budget exhausted; retry no earlier than `resume_at` (local wall time).
    Exhausted {
        window: QuotaWindow,
        resume_at: NaiveDateTime,
    },
}

/// Counters for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaState {
    pub day: NaiveDate,
    pub hour: u32,
    pub sent_today: u32,
    pub sent_this_hour: u32,
}

impl QuotaState {
    fn new(now: NaiveDateTime) -> Self {
        Self {
            day: now.date(),
            hour: now.hour(),
            sent_today: 0,
            sent_this_hour: 0,
        }
    }

    /// Reset counters whose window has rolled over.
    fn roll(&mut self, now: NaiveDateTime) {
        if now.date() != self.day {
            *self = Self::new(now);
        } else if now.hour() != self.hour {
            self.hour = now.hour();
            self.sent_this_hour = 0;
        }
    }
}

fn next_midnight(now: NaiveDateTime) -> NaiveDateTime {
    now.date()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(now)
}

fn next_hour(now: NaiveDateTime) -> NaiveDateTime {
    now.date()
        .and_hms_opt(now.hour(), 0, 0)
        .map(|h| h + chrono::Duration::hours(1))
        .unwrap_or(now)
}

/// Shared per-channel quota counters.
#[derive(Debug, Default)]
pub struct QuotaManager {
    states: Mutex<HashMap<String, QuotaState>>,
}

impl QuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check both caps and consume one slot if both allow it.
    pub fn try_reserve(&self, channel_id: &str, limits: QuotaLimits, now: NaiveDateTime) -> QuotaDecision {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(channel_id.to_string())
            .or_insert_with(|| QuotaState::new(now));
        state.roll(now);

        if state.sent_today >= limits.daily {
            return QuotaDecision::Exhausted {
                window: QuotaWindow::Daily,
                resume_at: next_midnight(now),
            };
        }
        if state.sent_this_hour >= limits.hourly {
            return QuotaDecision::Exhausted {
                window: QuotaWindow::Hourly,
                resume_at: next_hour(now),
            };
        }

        state.sent_today += 1;
        state.sent_this_hour += 1;
        QuotaDecision::Granted
    }

    /// Give back a slot reserved for a send that never happened.
    pub fn release(&self, channel_id: &str, now: NaiveDateTime) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(channel_id) {
            if state.day == now.date() {
                state.sent_today = state.sent_today.saturating_sub(1);
                if state.hour == now.hour() {
                    state.sent_this_hour = state.sent_this_hour.saturating_sub(1);
                }
            }
        }
    }

    /// Current counters for a channel, rolled to `now`.
    pub fn usage(&self, channel_id: &str, now: NaiveDateTime) -> QuotaState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = states
            .get(channel_id)
            .copied()
            .unwrap_or_else(|| QuotaState::new(now));
        state.roll(now);
        state
    }
}
