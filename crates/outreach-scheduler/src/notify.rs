//! Job events — one notification per committed store mutation.
//! Consumers (dashboards, CLI tail) subscribe; the dispatcher never listens.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{AutomationJob, JobStatus};

/// What changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JobEventKind {
    Created,
    StatusChanged { from: JobStatus, to: JobStatus },
    /// Counters, cursor or log moved without a status change.
    Progress,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub kind: JobEventKind,
    pub status: JobStatus,
    pub current_index: usize,
    pub sent_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    fn of(job: &AutomationJob, kind: JobEventKind) -> Self {
        Self {
            job_id: job.id.clone(),
            kind,
            status: job.status,
            current_index: job.current_index,
            sent_count: job.sent_count,
            failed_count: job.failed_count,
            skipped_count: job.skipped_count,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast fan-out. Events are dropped when nobody listens.
#[derive(Debug, Clone)]
pub struct JobNotifier {
    tx: broadcast::Sender<JobEvent>,
}

impl JobNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: JobEvent) {
        tracing::trace!("📣 job {} {:?}", event.job_id, event.kind);
        let _ = self.tx.send(event);
    }

    pub fn created(&self, job: &AutomationJob) {
        self.emit(JobEvent::of(job, JobEventKind::Created));
    }

    pub fn updated(&self, before: &AutomationJob, after: &AutomationJob) {
        let kind = if before.status != after.status {
            JobEventKind::StatusChanged {
                from: before.status,
                to: after.status,
            }
        } else {
            JobEventKind::Progress
        };
        self.emit(JobEvent::of(after, kind));
    }

    pub fn deleted(&self, job: &AutomationJob) {
        self.emit(JobEvent::of(job, JobEventKind::Deleted));
    }
}

impl Default for JobNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}
