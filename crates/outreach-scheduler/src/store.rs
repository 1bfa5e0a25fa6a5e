//! Job store — durable home of every `AutomationJob`.
//!
//! All mutations go through `update`, an atomic read-modify-write that
//! refuses successors which rewrite the execution log or move the cursor
//! back. Each committed mutation is announced on the store's notifier.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use tokio::sync::broadcast;

use crate::job::{AutomationJob, JobCommand, JobStatus};
use crate::notify::{JobEvent, JobNotifier};

/// Mutation applied inside `JobStore::update`. Returning `Err` aborts the
/// update with nothing written.
pub type JobMutation<'a> = &'a mut dyn FnMut(&mut AutomationJob) -> Result<()>;

pub trait JobStore: Send + Sync {
    fn insert(&self, job: &AutomationJob) -> Result<()>;

    fn get(&self, id: &str) -> Result<AutomationJob>;

    /// All jobs, oldest first.
    fn list(&self) -> Result<Vec<AutomationJob>>;

    fn with_status(&self, status: JobStatus) -> Result<Vec<AutomationJob>>;

    /// Atomically load, mutate and write back one job.
    fn update(&self, id: &str, mutate: JobMutation<'_>) -> Result<AutomationJob>;

    /// Remove a terminal job.
    fn delete(&self, id: &str) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;

    /// Scheduled jobs whose `scheduled_at` has been reached.
    fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<AutomationJob>> {
        Ok(self
            .with_status(JobStatus::Scheduled)?
            .into_iter()
            .filter(|j| j.scheduled_at.is_some_and(|at| at <= now))
            .collect())
    }
}

/// Run `mutate` on a copy of `current` and validate the result.
/// `None` means the mutation changed nothing.
pub(crate) fn mutate_copy(
    current: &AutomationJob,
    mutate: JobMutation<'_>,
) -> Result<Option<AutomationJob>> {
    let mut next = current.clone();
    mutate(&mut next)?;
    if next == *current {
        return Ok(None);
    }
    current.check_successor(&next)?;
    next.updated_at = Utc::now().max(current.updated_at);
    Ok(Some(next))
}

pub(crate) fn ensure_deletable(job: &AutomationJob) -> Result<()> {
    if job.status.is_terminal() {
        Ok(())
    } else {
        Err(OutreachError::JobActive(job.id.clone()))
    }
}

/// Apply an operator command through any store. Returns the job after the
/// command and whether it changed anything.
pub fn apply_command(
    store: &dyn JobStore,
    id: &str,
    command: JobCommand,
    now: DateTime<Utc>,
) -> Result<(AutomationJob, bool)> {
    let mut changed = false;
    let job = store.update(id, &mut |job: &mut AutomationJob| {
        changed = job.apply(command, now)?;
        Ok(())
    })?;
    Ok((job, changed))
}

/// In-process store; contents are lost on exit.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<AutomationJob>>,
    notifier: JobNotifier,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, Vec<AutomationJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: &AutomationJob) -> Result<()> {
        let mut jobs = self.jobs();
        if jobs.iter().any(|j| j.id == job.id) {
            return Err(OutreachError::Database(format!("job {} already exists", job.id)));
        }
        jobs.push(job.clone());
        drop(jobs);
        self.notifier.created(job);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<AutomationJob> {
        self.jobs()
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| OutreachError::JobNotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<AutomationJob>> {
        Ok(self.jobs().clone())
    }

    fn with_status(&self, status: JobStatus) -> Result<Vec<AutomationJob>> {
        Ok(self
            .jobs()
            .iter()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    fn update(&self, id: &str, mutate: JobMutation<'_>) -> Result<AutomationJob> {
        let mut jobs = self.jobs();
        let slot = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| OutreachError::JobNotFound(id.to_string()))?;

        let Some(next) = mutate_copy(slot, mutate)? else {
            return Ok(slot.clone());
        };
        let before = std::mem::replace(slot, next.clone());
        drop(jobs);

        self.notifier.updated(&before, &next);
        Ok(next)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs();
        let pos = jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| OutreachError::JobNotFound(id.to_string()))?;
        ensure_deletable(&jobs[pos])?;
        let removed = jobs.remove(pos);
        drop(jobs);

        tracing::info!("🗑️ Job deleted: {}", removed.id);
        self.notifier.deleted(&removed);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{LogEntry, LogStatus, NewJob};
    use crate::notify::JobEventKind;
    use outreach_core::config::{DispatchConfig, ScheduleType};
    use outreach_core::types::Target;

    fn job(n: usize) -> AutomationJob {
        AutomationJob::create(
            NewJob {
                affiliate_id: "aff".into(),
                channel_id: Some("wa".into()),
                targets: (0..n).map(|i| Target::new(format!("t{i}"), "", "hi")).collect(),
                config: DispatchConfig::default(),
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn sent(target: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            target_id: target.into(),
            target_name: String::new(),
            status: LogStatus::Sent,
            error: None,
            delay_seconds: Some(1.0),
        }
    }

    #[test]
    fn test_insert_get_list() {
        let store = MemoryJobStore::new();
        let a = job(1);
        let b = job(2);
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();
        assert!(store.insert(&a).is_err());

        assert_eq!(store.get(&b.id).unwrap().targets.len(), 2);
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert!(matches!(store.get("nope"), Err(OutreachError::JobNotFound(_))));
    }

    #[test]
    fn test_update_is_all_or_nothing() {
        let store = MemoryJobStore::new();
        let j = job(2);
        store.insert(&j).unwrap();

        let result = store.update(&j.id, &mut |job: &mut AutomationJob| {
            job.record(sent("t0"));
            Err(OutreachError::Other("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.get(&j.id).unwrap().current_index, 0);

        let updated = store
            .update(&j.id, &mut |job: &mut AutomationJob| {
                job.record(sent("t0"));
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.sent_count, 1);
        assert_eq!(store.get(&j.id).unwrap().execution_log.len(), 1);
    }

    #[test]
    fn test_update_rejects_log_rewrite() {
        let store = MemoryJobStore::new();
        let j = job(2);
        store.insert(&j).unwrap();
        store
            .update(&j.id, &mut |job: &mut AutomationJob| {
                job.record(sent("t0"));
                Ok(())
            })
            .unwrap();

        let result = store.update(&j.id, &mut |job: &mut AutomationJob| {
            job.execution_log.clear();
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.get(&j.id).unwrap().execution_log.len(), 1);
    }

    #[test]
    fn test_delete_only_terminal() {
        let store = MemoryJobStore::new();
        let j = job(1);
        store.insert(&j).unwrap();
        assert!(matches!(store.delete(&j.id), Err(OutreachError::JobActive(_))));

        apply_command(&store, &j.id, JobCommand::Cancel, Utc::now()).unwrap();
        store.delete(&j.id).unwrap();
        assert!(store.get(&j.id).is_err());
    }

    #[test]
    fn test_due_scheduled() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        for offset in [-60, 60] {
            let mut j = job(1);
            j.config.schedule_type = ScheduleType::Scheduled;
            j.config.scheduled_at = Some(now + chrono::Duration::minutes(offset));
            j.schedule().unwrap();
            store.insert(&j).unwrap();
        }
        store.insert(&job(1)).unwrap();

        let due = store.due_scheduled(now).unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].scheduled_at.unwrap() <= now);
    }

    #[tokio::test]
    async fn test_events_on_commit_only() {
        let store = MemoryJobStore::new();
        let mut rx = store.subscribe();
        let j = job(1);
        store.insert(&j).unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, JobEventKind::Created);

        // Resume is only legal from paused.
        assert!(apply_command(&store, &j.id, JobCommand::Resume, Utc::now()).is_err());

        let (after, changed) = apply_command(&store, &j.id, JobCommand::Start, Utc::now()).unwrap();
        assert!(changed);
        assert_eq!(after.status, JobStatus::Running);
        assert_eq!(
            rx.recv().await.unwrap().kind,
            JobEventKind::StatusChanged {
                from: JobStatus::Pending,
                to: JobStatus::Running
            }
        );

        // No-op command: nothing committed, nothing emitted.
        let (_, changed) = apply_command(&store, &j.id, JobCommand::Resume, Utc::now()).unwrap();
        assert!(!changed);
        assert!(rx.try_recv().is_err());
    }
}
