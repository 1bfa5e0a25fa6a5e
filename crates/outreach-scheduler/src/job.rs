//! Automation job — the data model and lifecycle of one batch-send campaign.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use outreach_core::config::{DispatchConfig, ScheduleType};
use outreach_core::error::{OutreachError, Result};
use outreach_core::types::Target;
use serde::{Deserialize, Serialize};

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal jobs accept nothing but deletion.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The closed transition table.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Scheduled)
                | (Scheduled, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Pending | Scheduled | Running | Paused, Cancelled)
                | (Running, Completed)
                | (Running | Scheduled, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = OutreachError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(OutreachError::Database(format!("unknown job status '{other}'"))),
        }
    }
}

/// Outcome recorded for one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Sent,
    Failed,
    Skipped,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Sent => "sent",
            LogStatus::Failed => "failed",
            LogStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for LogStatus {
    type Err = OutreachError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(LogStatus::Sent),
            "failed" => Ok(LogStatus::Failed),
            "skipped" => Ok(LogStatus::Skipped),
            other => Err(OutreachError::Database(format!("unknown log status '{other}'"))),
        }
    }
}

/// One entry of the append-only execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub target_id: String,
    pub target_name: String,
    pub status: LogStatus,
    pub error: Option<String>,
    /// Wait applied before this attempt, in seconds.
    pub delay_seconds: Option<f64>,
}

/// Request to create a job, supplied by the UI/API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub affiliate_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub config: DispatchConfig,
}

/// Control requests accepted from the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCommand {
    Start,
    Pause,
    Resume,
    Cancel,
}

/// One batch-send campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationJob {
    pub id: String,
    pub affiliate_id: String,
    /// Messaging channel; may be resolved after creation.
    pub channel_id: Option<String>,
    pub targets: Vec<Target>,
    pub status: JobStatus,
    /// Snapshot taken at creation; later edits to defaults never reach it.
    pub config: DispatchConfig,
    pub sent_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    pub current_index: usize,
    pub current_target_id: Option<String>,
    /// Set while a send call is outstanding, cleared once its outcome is logged.
    pub attempt_in_flight: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub execution_log: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationJob {
    /// Validate a request and build a `pending` job from it.
    pub fn create(request: NewJob, now: DateTime<Utc>) -> Result<Self> {
        if request.affiliate_id.trim().is_empty() {
            return Err(OutreachError::Validation("affiliate_id is required".into()));
        }
        if request.targets.is_empty() {
            return Err(OutreachError::Validation("job has no targets".into()));
        }
        if let Some(t) = request.targets.iter().find(|t| t.id.trim().is_empty()) {
            return Err(OutreachError::Validation(format!(
                "target '{}' has an empty id",
                t.display_name
            )));
        }
        request.config.validate()?;

        let current_target_id = request.targets.first().map(|t| t.id.clone());
        Ok(Self {
            id: format!("job-{}", uuid::Uuid::new_v4()),
            affiliate_id: request.affiliate_id,
            channel_id: request.channel_id.filter(|c| !c.trim().is_empty()),
            targets: request.targets,
            status: JobStatus::Pending,
            config: request.config,
            sent_count: 0,
            failed_count: 0,
            skipped_count: 0,
            current_index: 0,
            current_target_id,
            attempt_in_flight: false,
            scheduled_at: None,
            started_at: None,
            paused_at: None,
            completed_at: None,
            last_error: None,
            execution_log: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_immediate(&self) -> bool {
        self.config.schedule_type == ScheduleType::Immediate
    }

    /// Every target has an outcome.
    pub fn is_exhausted(&self) -> bool {
        self.current_index >= self.targets.len()
    }

    pub fn processed(&self) -> u32 {
        self.sent_count + self.failed_count + self.skipped_count
    }

    /// Percentage of targets processed.
    pub fn progress(&self) -> f64 {
        if self.targets.is_empty() {
            return 100.0;
        }
        self.current_index as f64 * 100.0 / self.targets.len() as f64
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OutreachError::invalid_transition(self.status, next));
        }
        tracing::debug!("job {}: {} → {}", self.id, self.status, next);
        self.status = next;
        Ok(())
    }

    // ─── Transitions ──────────────────────────────────────

    /// First move after creation: scheduled jobs wait for their start time,
    /// immediate jobs start as soon as a channel is known.
    pub fn admit(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.config.schedule_type {
            ScheduleType::Scheduled => self.schedule(),
            ScheduleType::Immediate if self.channel_id.is_some() => self.start(now),
            ScheduleType::Immediate => Ok(()),
        }
    }

    /// pending/scheduled → running.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.channel_id.is_none() {
            return Err(OutreachError::Validation(format!(
                "job {} has no messaging channel",
                self.id
            )));
        }
        self.transition(JobStatus::Running)?;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        Ok(())
    }

    /// pending → scheduled, waiting for `config.scheduled_at`.
    pub fn schedule(&mut self) -> Result<()> {
        let at = self.config.scheduled_at.ok_or_else(|| {
            OutreachError::Validation(format!("job {} has no scheduled_at", self.id))
        })?;
        self.transition(JobStatus::Scheduled)?;
        self.scheduled_at = Some(at);
        Ok(())
    }

    /// running → paused. Pausing a paused job is a no-op.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if self.status == JobStatus::Paused {
            return Ok(false);
        }
        self.transition(JobStatus::Paused)?;
        self.paused_at = Some(now);
        Ok(true)
    }

    /// paused → running. Resuming a running job is a no-op.
    pub fn resume(&mut self) -> Result<bool> {
        match self.status {
            JobStatus::Running => Ok(false),
            JobStatus::Paused => {
                self.transition(JobStatus::Running)?;
                self.paused_at = None;
                Ok(true)
            }
            other => Err(OutreachError::invalid_transition(other, JobStatus::Running)),
        }
    }

    /// Any non-terminal state → cancelled. Cancelling twice is a no-op.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if self.status == JobStatus::Cancelled {
            return Ok(false);
        }
        self.transition(JobStatus::Cancelled)?;
        self.completed_at = Some(now);
        Ok(true)
    }

    /// running → completed.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(now);
        self.current_target_id = None;
        Ok(())
    }

    /// running/scheduled → failed, recording why.
    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(now);
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Apply an operator command. Returns whether anything changed.
    pub fn apply(&mut self, command: JobCommand, now: DateTime<Utc>) -> Result<bool> {
        match command {
            JobCommand::Start => {
                if self.status == JobStatus::Running {
                    return Ok(false);
                }
                self.start(now)?;
                Ok(true)
            }
            JobCommand::Pause => self.pause(now),
            JobCommand::Resume => self.resume(),
            JobCommand::Cancel => self.cancel(now),
        }
    }

    /// Attach a messaging channel before the job starts.
    pub fn assign_channel(&mut self, channel_id: &str) -> Result<()> {
        if !matches!(self.status, JobStatus::Pending | JobStatus::Scheduled) {
            return Err(OutreachError::Validation(format!(
                "channel of {} job {} can no longer change",
                self.status, self.id
            )));
        }
        if channel_id.trim().is_empty() {
            return Err(OutreachError::Validation("channel_id is empty".into()));
        }
        self.channel_id = Some(channel_id.to_string());
        Ok(())
    }

    // ─── Progress ──────────────────────────────────────

    /// Mark the target at `current_index` as being sent right now.
    pub fn begin_attempt(&mut self) {
        self.current_target_id = self.targets.get(self.current_index).map(|t| t.id.clone());
        self.attempt_in_flight = true;
    }

    /// Append an outcome and advance past the current target.
    pub fn record(&mut self, entry: LogEntry) {
        match entry.status {
            LogStatus::Sent => {
                self.sent_count += 1;
                self.last_error = None;
            }
            LogStatus::Failed => {
                self.failed_count += 1;
                self.last_error = entry.error.clone();
            }
            LogStatus::Skipped => self.skipped_count += 1,
        }
        self.execution_log.push(entry);
        self.current_index += 1;
        self.attempt_in_flight = false;
        self.current_target_id = self.targets.get(self.current_index).map(|t| t.id.clone());
        debug_assert_eq!(self.processed() as usize, self.current_index);
    }

    /// Check that `next` is a legal committed successor of `self`:
    /// the log only grows and the cursor never moves back.
    pub fn check_successor(&self, next: &AutomationJob) -> Result<()> {
        if next.id != self.id {
            return Err(OutreachError::Other("job id cannot change".into()));
        }
        if next.current_index < self.current_index {
            return Err(OutreachError::Other(format!(
                "job {}: current_index moved back ({} → {})",
                self.id, self.current_index, next.current_index
            )));
        }
        let prefix_kept = next.execution_log.len() >= self.execution_log.len()
            && next.execution_log[..self.execution_log.len()] == self.execution_log[..];
        if !prefix_kept {
            return Err(OutreachError::Other(format!(
                "job {}: execution log is append-only",
                self.id
            )));
        }
        if next.processed() as usize > next.targets.len() {
            return Err(OutreachError::Other(format!(
                "job {}: more outcomes than targets",
                self.id
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            affiliate_id: self.affiliate_id.clone(),
            channel_id: self.channel_id.clone(),
            status: self.status,
            total: self.targets.len(),
            sent: self.sent_count,
            failed: self.failed_count,
            skipped: self.skipped_count,
            progress_percent: self.progress(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Compact view for listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub affiliate_id: String,
    pub channel_id: Option<String>,
    pub status: JobStatus,
    pub total: usize,
    pub sent: u32,
    pub failed: u32,
    pub skipped: u32,
    pub progress_percent: f64,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(n: usize) -> NewJob {
        NewJob {
            affiliate_id: "aff-1".into(),
            channel_id: Some("wa-1".into()),
            targets: (0..n)
                .map(|i| Target::new(format!("t{i}"), format!("Shop {i}"), "Hello"))
                .collect(),
            config: DispatchConfig::default(),
        }
    }

    fn entry(status: LogStatus) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            target_id: "t".into(),
            target_name: "Shop".into(),
            status,
            error: (status == LogStatus::Failed).then(|| "timeout".to_string()),
            delay_seconds: None,
        }
    }

    #[test]
    fn test_create_validates() {
        assert!(AutomationJob::create(request(0), Utc::now()).is_err());

        let mut req = request(2);
        req.affiliate_id = " ".into();
        assert!(AutomationJob::create(req, Utc::now()).is_err());

        let job = AutomationJob::create(request(2), Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_target_id.as_deref(), Some("t0"));
        assert!(job.id.starts_with("job-"));
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Scheduled.can_transition_to(Running));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_start_requires_channel() {
        let mut req = request(1);
        req.channel_id = None;
        let mut job = AutomationJob::create(req, Utc::now()).unwrap();
        assert!(job.start(Utc::now()).is_err());
        assert_eq!(job.status, JobStatus::Pending);

        job.assign_channel("wa-9").unwrap();
        job.start(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.assign_channel("wa-10").is_err());
    }

    #[test]
    fn test_pause_resume_idempotent() {
        let now = Utc::now();
        let mut job = AutomationJob::create(request(3), now).unwrap();
        job.start(now).unwrap();

        assert!(!job.resume().unwrap()); // running → no-op
        assert!(job.pause(now).unwrap());
        assert_eq!(job.paused_at, Some(now));
        assert!(!job.pause(now).unwrap()); // paused → no-op
        assert!(job.resume().unwrap());
        assert_eq!(job.paused_at, None);
        assert_eq!(job.started_at, Some(now));
    }

    #[test]
    fn test_cancel_from_any_non_terminal_state() {
        let now = Utc::now();
        for prepare in [0, 1, 2, 3] {
            let mut job = AutomationJob::create(request(3), now).unwrap();
            match prepare {
                1 => job.start(now).unwrap(),
                2 => {
                    job.start(now).unwrap();
                    job.record(entry(LogStatus::Sent));
                    job.pause(now).unwrap();
                }
                3 => {
                    job.config.schedule_type = ScheduleType::Scheduled;
                    job.config.scheduled_at = Some(now);
                    job.schedule().unwrap();
                }
                _ => {}
            }
            let index = job.current_index;
            assert!(job.cancel(now).unwrap());
            assert_eq!(job.status, JobStatus::Cancelled);
            assert_eq!(job.current_index, index);
            assert_eq!(job.completed_at, Some(now));
            assert!(!job.cancel(now).unwrap());
            assert!(job.resume().is_err());
        }
    }

    #[test]
    fn test_record_counters_and_last_error() {
        let now = Utc::now();
        let mut job = AutomationJob::create(request(3), now).unwrap();
        job.start(now).unwrap();

        job.begin_attempt();
        assert!(job.attempt_in_flight);
        job.record(entry(LogStatus::Failed));
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
        assert!(!job.attempt_in_flight);

        job.record(entry(LogStatus::Skipped));
        assert_eq!(job.last_error.as_deref(), Some("timeout"));

        job.record(entry(LogStatus::Sent));
        assert_eq!(job.last_error, None);
        assert_eq!((job.sent_count, job.failed_count, job.skipped_count), (1, 1, 1));
        assert_eq!(job.current_index, 3);
        assert!(job.is_exhausted());
        assert_eq!(job.current_target_id, None);

        job.complete(now).unwrap();
        assert_eq!(job.summary().progress_percent, 100.0);
    }

    #[test]
    fn test_check_successor_rejects_rewrites() {
        let now = Utc::now();
        let mut job = AutomationJob::create(request(2), now).unwrap();
        job.record(entry(LogStatus::Sent));

        let mut next = job.clone();
        next.record(entry(LogStatus::Sent));
        assert!(job.check_successor(&next).is_ok());

        let mut rewritten = next.clone();
        rewritten.execution_log[0].status = LogStatus::Failed;
        assert!(job.check_successor(&rewritten).is_err());

        let mut rewound = job.clone();
        rewound.current_index = 0;
        assert!(job.check_successor(&rewound).is_err());
    }

    #[test]
    fn test_admit() {
        let now = Utc::now();
        let mut job = AutomationJob::create(request(1), now).unwrap();
        job.admit(now).unwrap();
        assert_eq!(job.status, JobStatus::Running);

        let mut req = request(1);
        req.channel_id = None;
        let mut job = AutomationJob::create(req, now).unwrap();
        job.admit(now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let mut req = request(1);
        req.config.schedule_type = ScheduleType::Scheduled;
        req.config.scheduled_at = Some(now + chrono::Duration::hours(2));
        let mut job = AutomationJob::create(req, now).unwrap();
        job.admit(now).unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.scheduled_at, job.config.scheduled_at);
    }

    #[test]
    fn test_apply_commands() {
        let now = Utc::now();
        let mut job = AutomationJob::create(request(1), now).unwrap();
        assert!(job.apply(JobCommand::Start, now).unwrap());
        assert!(!job.apply(JobCommand::Start, now).unwrap());
        assert!(job.apply(JobCommand::Pause, now).unwrap());
        assert!(job.apply(JobCommand::Cancel, now).unwrap());
        assert!(job.apply(JobCommand::Start, now).is_err());
    }

    #[test]
    fn test_status_round_trip_strings() {
        for s in ["pending", "scheduled", "running", "paused", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<JobStatus>().unwrap().as_str(), s);
        }
        assert!("archived".parse::<JobStatus>().is_err());
    }
}
