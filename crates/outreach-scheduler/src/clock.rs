//! Wall-clock source for schedule and quota decisions.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

/// Injectable clock. Schedule windows and quota resets use local wall time;
/// job timestamps use UTC.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn local_now(&self) -> NaiveDateTime;

    /// Convert a UTC instant to local wall time.
    fn to_local(&self, at: DateTime<Utc>) -> NaiveDateTime;

    /// Real time until the given local wall time (zero if already past).
    fn until(&self, at: NaiveDateTime) -> std::time::Duration {
        (at - self.local_now()).to_std().unwrap_or_default()
    }
}

/// The host clock in the host timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn to_local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.with_timezone(&Local).naive_local()
    }
}

/// Wall clock that starts at a fixed instant and advances with tokio's
/// clock, so paused-time runtimes fast-forward it along with every sleep.
/// Local time equals UTC.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    anchor: NaiveDateTime,
    started: tokio::time::Instant,
}

impl SimulatedClock {
    pub fn starting_at(anchor: NaiveDateTime) -> Self {
        Self {
            anchor,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.local_now())
    }

    fn local_now(&self) -> NaiveDateTime {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor + elapsed
    }

    fn to_local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.naive_utc()
    }
}
