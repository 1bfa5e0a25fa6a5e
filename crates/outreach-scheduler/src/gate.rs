//! Schedule gate — time-window admission, independent of quota.

use std::collections::BTreeSet;

use chrono::{Datelike, Days, NaiveDateTime, Timelike};
use outreach_core::config::DispatchConfig;

use crate::clock::Clock;

/// Allowed send window in local wall time: weekday ∈ `days`,
/// hour ∈ [`start_hour`, `end_hour`), and not before `not_before`.
#[derive(Debug, Clone)]
pub struct ScheduleGate {
    start_hour: u32,
    end_hour: u32,
    /// 0 = Sunday … 6 = Saturday.
    days: BTreeSet<u32>,
    not_before: Option<NaiveDateTime>,
}

impl ScheduleGate {
    pub fn new(start_hour: u32, end_hour: u32, days: BTreeSet<u32>) -> Self {
        Self {
            start_hour,
            end_hour,
            days,
            not_before: None,
        }
    }

    /// Gate for a job's config; a deferred `scheduled_at` becomes `not_before`.
    pub fn for_job(config: &DispatchConfig, clock: &dyn Clock) -> Self {
        let mut gate = Self::new(
            config.send_start_hour,
            config.send_end_hour,
            config.send_days.clone(),
        );
        gate.not_before = config.scheduled_at.map(|at| clock.to_local(at));
        gate
    }

    pub fn with_not_before(mut self, at: NaiveDateTime) -> Self {
        self.not_before = Some(at);
        self
    }

    fn in_window(&self, at: NaiveDateTime) -> bool {
        let weekday = at.weekday().num_days_from_sunday();
        let hour = at.hour();
        self.days.contains(&weekday) && hour >= self.start_hour && hour < self.end_hour
    }

    pub fn allowed(&self, now: NaiveDateTime) -> bool {
        if self.not_before.is_some_and(|nb| now < nb) {
            return false;
        }
        self.in_window(now)
    }

    /// Earliest instant ≥ `now` at which `allowed` holds.
    /// `None` only if no weekday is allowed at all.
    pub fn next_allowed(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let from = match self.not_before {
            Some(nb) if nb > now => nb,
            _ => now,
        };
        if self.in_window(from) {
            return Some(from);
        }

        for offset in 0..=7u64 {
            let date = from.date().checked_add_days(Days::new(offset))?;
            if !self.days.contains(&date.weekday().num_days_from_sunday()) {
                continue;
            }
            let open = date.and_hms_opt(self.start_hour, 0, 0)?;
            if open >= from {
                return Some(open);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    // 2026-10-14 is a Wednesday, 2026-10-17 a Saturday.
    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn weekday_gate() -> ScheduleGate {
        ScheduleGate::new(8, 20, (1..=5).collect())
    }

    #[test]
    fn test_weekday_window() {
        let gate = weekday_gate();
        assert!(gate.allowed(at(14, 10, 0)));
        assert!(!gate.allowed(at(17, 10, 0)));
    }

    #[test]
    fn test_half_open_hours() {
        let gate = weekday_gate();
        assert!(gate.allowed(at(14, 8, 0)));
        assert!(gate.allowed(at(14, 19, 59)));
        assert!(!gate.allowed(at(14, 20, 0)));
        assert!(!gate.allowed(at(14, 7, 59)));
    }

    #[test]
    fn test_next_allowed() {
        let gate = weekday_gate();
        // Already open.
        assert_eq!(gate.next_allowed(at(14, 10, 0)), Some(at(14, 10, 0)));
        // Before opening → same day.
        assert_eq!(gate.next_allowed(at(14, 6, 30)), Some(at(14, 8, 0)));
        // After closing → next day.
        assert_eq!(gate.next_allowed(at(14, 21, 0)), Some(at(15, 8, 0)));
        // Saturday → Monday.
        assert_eq!(gate.next_allowed(at(17, 10, 0)), Some(at(19, 8, 0)));
    }

    #[test]
    fn test_end_of_day_window() {
        let gate = ScheduleGate::new(0, 24, (0..=6).collect());
        assert!(gate.allowed(at(17, 23, 59)));
        assert!(gate.allowed(at(17, 0, 0)));
    }

    #[test]
    fn test_not_before_defers_start() {
        let gate = weekday_gate().with_not_before(at(15, 9, 30));
        assert!(!gate.allowed(at(14, 10, 0)));
        assert_eq!(gate.next_allowed(at(14, 10, 0)), Some(at(15, 9, 30)));
        assert!(gate.allowed(at(15, 9, 30)));

        // Deferred into a closed window → next opening after it.
        let gate = weekday_gate().with_not_before(at(16, 21, 0));
        assert_eq!(gate.next_allowed(at(14, 10, 0)), Some(at(19, 8, 0)));
    }

    #[test]
    fn test_no_days_never_opens() {
        let gate = ScheduleGate::new(8, 20, BTreeSet::new());
        assert!(!gate.allowed(at(14, 10, 0)));
        assert_eq!(gate.next_allowed(at(14, 10, 0)), None);
    }
}
