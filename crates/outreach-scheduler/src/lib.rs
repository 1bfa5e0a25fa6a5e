//! # Outreach Scheduler
//!
//! Paced, quota-aware batch dispatcher for outreach campaigns.
//!
//! ## Architecture
//! ```text
//! Trigger (tokio interval)
//!   ├── scheduled jobs due → running
//!   └── running jobs without a loop → adopt
//!
//! DispatchEngine ── one loop per running job
//!   └── run_job
//!         ├── ScheduleGate   (hours × weekdays, deferred start)
//!         ├── QuotaManager   (daily/hourly per channel, warm-up ramp)
//!         ├── PacingEngine   (delay, jitter, back-off, rests, typing)
//!         ├── SendChannel    (WhatsApp, webhook, dry-run)
//!         └── CircuitBreaker (consecutive failures → failed)
//!
//! JobStore (memory | SQLite) ── JobEvent broadcast on every commit
//! ```

pub mod breaker;
pub mod clock;
pub mod dispatch;
pub mod engine;
pub mod gate;
pub mod job;
pub mod notify;
pub mod pacing;
pub mod persistence;
pub mod quota;
pub mod store;

pub use breaker::{BreakerState, CircuitBreaker};
pub use clock::{Clock, SimulatedClock, SystemClock};
pub use dispatch::{ChannelLocks, DispatchContext, run_job};
pub use engine::{DispatchEngine, TickReport, spawn_trigger};
pub use gate::ScheduleGate;
pub use job::{AutomationJob, JobCommand, JobStatus, JobSummary, LogEntry, LogStatus, NewJob};
pub use notify::{JobEvent, JobEventKind, JobNotifier};
pub use pacing::{PacingDecision, PacingEngine, PacingStep};
pub use persistence::SqliteJobStore;
pub use quota::{QuotaDecision, QuotaLimits, QuotaManager, QuotaState, effective_daily_limit};
pub use store::{JobStore, MemoryJobStore, apply_command};
