//! Dispatch loop — drives one running job target by target.
//!
//! ```text
//! re-read status ─▶ gate ─▶ pacing sleep ─▶ typing ─▶ lock ─▶ quota ─▶ send ─▶ record
//!       ▲                                                                       │
//!       └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every wait is chopped into poll-sized slices that re-read the job, so a
//! pause or cancel is seen within one poll interval (or at once when the
//! engine pokes the loop's `Notify`). A send that has started is always
//! allowed to finish and its outcome is always recorded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outreach_core::config::DispatchConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::SendChannel;
use outreach_core::types::{SendOutcome, Target};
use tokio::sync::{Notify, OwnedMutexGuard};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::clock::Clock;
use crate::gate::ScheduleGate;
use crate::job::{AutomationJob, JobStatus, LogEntry, LogStatus};
use crate::pacing::{PacingDecision, PacingEngine, PacingStep, rest_duration};
use crate::quota::{QuotaDecision, QuotaLimits, QuotaManager};
use crate::store::JobStore;

/// Error text recorded for an attempt whose outcome was lost to a restart.
pub const INTERRUPTED_ATTEMPT: &str = "dispatch interrupted before outcome was recorded";

/// Store attempts for an outcome that has already happened.
const RECORD_ATTEMPTS: u32 = 5;
const RECORD_RETRY_BASE: Duration = Duration::from_millis(200);

/// Upper bound for a single wait, far enough to mean "never".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// One async mutex per messaging channel: never two sends in flight on the
/// same channel, whichever jobs they belong to.
#[derive(Debug, Default)]
pub struct ChannelLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChannelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, channel_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(channel_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Everything a dispatch loop needs, shared by all loops of one engine.
pub struct DispatchContext {
    pub store: Arc<dyn JobStore>,
    pub channel: Arc<dyn SendChannel>,
    pub clock: Arc<dyn Clock>,
    pub quotas: Arc<QuotaManager>,
    pub locks: Arc<ChannelLocks>,
    /// Upper bound on how long a pause/cancel can go unnoticed.
    pub poll_interval: Duration,
}

enum Wait {
    Elapsed,
    /// The job left `running` while we waited.
    Interrupted(JobStatus),
}

/// Map a channel outcome to the log status and error text it records.
fn classify(outcome: SendOutcome, config: &DispatchConfig) -> (LogStatus, Option<String>) {
    match outcome {
        SendOutcome::Delivered => (LogStatus::Sent, None),
        SendOutcome::Failed(reason) => (LogStatus::Failed, Some(reason)),
        SendOutcome::Blocked(reason) if config.detect_blacklist => (LogStatus::Skipped, Some(reason)),
        SendOutcome::Blocked(reason) => (LogStatus::Failed, Some(format!("blocked: {reason}"))),
    }
}

/// `sent_count` at which the current rest was already taken: a rest shows up
/// as the delay of the next logged attempt, and only counts while no send
/// has succeeded since.
fn rest_taken_at(job: &AutomationJob) -> Option<u32> {
    if !job.config.random_pause {
        return None;
    }
    let rest = rest_duration(&job.config).as_secs_f64();
    job.execution_log
        .iter()
        .rev()
        .take_while(|e| e.status != LogStatus::Sent)
        .any(|e| e.delay_seconds == Some(rest))
        .then_some(job.sent_count)
}

fn log_completed(job: &AutomationJob) {
    tracing::info!(
        "✅ Job {} completed: {} sent, {} failed, {} skipped",
        job.id,
        job.sent_count,
        job.failed_count,
        job.skipped_count
    );
}

impl DispatchContext {
    fn status(&self, job_id: &str) -> Result<JobStatus> {
        Ok(self.store.get(job_id)?.status)
    }

    /// Sleep for `duration`, waking every poll interval (or when poked) to
    /// check the job is still running.
    async fn wait(&self, job_id: &str, duration: Duration, wake: &Notify) -> Result<Wait> {
        let start = tokio::time::Instant::now();
        let deadline = start
            .checked_add(duration)
            .unwrap_or_else(|| start + FAR_FUTURE);
        loop {
            let slice = deadline
                .saturating_duration_since(tokio::time::Instant::now())
                .min(self.poll_interval);
            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                _ = wake.notified() => {}
            }
            let status = self.status(job_id)?;
            if status != JobStatus::Running {
                return Ok(Wait::Interrupted(status));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Wait::Elapsed);
            }
        }
    }

    /// Log an attempt that was marked in flight when the process died.
    /// The target is not re-sent.
    fn recover_interrupted(&self, job: &AutomationJob) -> Result<AutomationJob> {
        let target = job.targets.get(job.current_index);
        tracing::warn!(
            "⚠️ Job {}: attempt for {} was interrupted, recording as failed",
            job.id,
            target.map(|t| t.id.as_str()).unwrap_or("?")
        );
        let entry = LogEntry {
            timestamp: self.clock.now(),
            target_id: target.map(|t| t.id.clone()).unwrap_or_default(),
            target_name: target.map(|t| t.display_name.clone()).unwrap_or_default(),
            status: LogStatus::Failed,
            error: Some(INTERRUPTED_ATTEMPT.to_string()),
            delay_seconds: None,
        };
        self.store.update(&job.id, &mut |j: &mut AutomationJob| {
            if j.attempt_in_flight && !j.is_exhausted() {
                j.record(entry.clone());
            } else {
                j.attempt_in_flight = false;
            }
            Ok(())
        })
    }

    fn fail_job(&self, job_id: &str, reason: &str) -> Result<JobStatus> {
        let now = self.clock.now();
        let job = self.store.update(job_id, &mut |j: &mut AutomationJob| {
            if j.status == JobStatus::Running {
                j.fail(now, reason)?;
            }
            Ok(())
        })?;
        Ok(job.status)
    }

    fn complete_job(&self, job_id: &str) -> Result<JobStatus> {
        let now = self.clock.now();
        let job = self.store.update(job_id, &mut |j: &mut AutomationJob| {
            if j.status == JobStatus::Running && j.is_exhausted() {
                j.complete(now)?;
            }
            Ok(())
        })?;
        if job.status == JobStatus::Completed {
            log_completed(&job);
        }
        Ok(job.status)
    }

    /// Mark the target at `index` as in flight, if the job is still running
    /// and still pointing at it.
    fn claim(&self, job_id: &str, index: usize) -> Result<bool> {
        let mut claimed = false;
        self.store.update(job_id, &mut |j: &mut AutomationJob| {
            claimed = j.status == JobStatus::Running && j.current_index == index && !j.attempt_in_flight;
            if claimed {
                j.begin_attempt();
            }
            Ok(())
        })?;
        Ok(claimed)
    }

    /// Record a finished attempt, retrying while the database is busy. The
    /// message is already out, so giving up here would later log it as
    /// interrupted.
    async fn record_outcome(&self, job_id: &str, entry: &LogEntry, tripped: bool) -> Result<AutomationJob> {
        let mut attempt = 1;
        loop {
            let now = self.clock.now();
            let result = self.store.update(job_id, &mut |j: &mut AutomationJob| {
                j.record(entry.clone());
                if j.status == JobStatus::Running {
                    if tripped {
                        j.fail(now, entry.error.clone().unwrap_or_default())?;
                    } else if j.is_exhausted() {
                        j.complete(now)?;
                    }
                }
                Ok(())
            });
            match result {
                Err(OutreachError::Database(e)) if attempt < RECORD_ATTEMPTS => {
                    tracing::warn!(
                        "⚠️ Job {}: recording {} failed (attempt {}/{}): {}",
                        job_id,
                        entry.target_id,
                        attempt,
                        RECORD_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(RECORD_RETRY_BASE * 2u32.pow(attempt - 1)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Call the channel. The caller holds the channel's lock.
    async fn send(&self, channel_id: &str, target: &Target) -> SendOutcome {
        match self.channel.send(channel_id, target).await {
            Ok(outcome) => outcome,
            Err(e) => SendOutcome::Failed(e.to_string()),
        }
    }
}

/// Drive a running job until it leaves `running`. Returns the status it
/// ended in. Errors only come from the job store.
pub async fn run_job(
    ctx: &DispatchContext,
    job_id: &str,
    wake: &Notify,
    pacing: &mut PacingEngine,
) -> Result<JobStatus> {
    let mut job = ctx.store.get(job_id)?;
    if job.status != JobStatus::Running {
        return Ok(job.status);
    }
    let Some(channel_id) = job.channel_id.clone() else {
        return ctx.fail_job(job_id, "no messaging channel assigned");
    };

    if job.attempt_in_flight {
        job = ctx.recover_interrupted(&job)?;
    }

    let config = job.config.clone();
    let gate = ScheduleGate::for_job(&config, ctx.clock.as_ref());
    let mut breaker = CircuitBreaker::from_history(&config, &job.execution_log);
    if breaker.state() == BreakerState::Tripped {
        let reason = job.last_error.clone().unwrap_or_else(|| "too many consecutive failures".into());
        tracing::warn!("🛑 Job {}: circuit breaker already tripped", job_id);
        return ctx.fail_job(job_id, &reason);
    }

    tracing::info!(
        "🚀 Dispatching job {} on {} ({}/{} done)",
        job_id,
        channel_id,
        job.current_index,
        job.targets.len()
    );
    let mut paced: Option<PacingDecision> = None;

    loop {
        // 1. Status
        let job = ctx.store.get(job_id)?;
        if job.status != JobStatus::Running {
            tracing::info!("⏸️ Job {} stopped dispatching ({})", job_id, job.status);
            return Ok(job.status);
        }
        if job.is_exhausted() {
            return ctx.complete_job(job_id);
        }

        // 2. Schedule gate
        let now = ctx.clock.local_now();
        if !gate.allowed(now) {
            let Some(next) = gate.next_allowed(now) else {
                return ctx.fail_job(job_id, "send window never opens");
            };
            tracing::debug!("🕗 Job {}: outside send window, waiting until {}", job_id, next);
            if let Wait::Interrupted(status) = ctx.wait(job_id, ctx.clock.until(next), wake).await? {
                return Ok(status);
            }
            continue;
        }

        // 3. Pacing, once per target. A quota or window wait after it does
        // not restart the delay.
        let decision = match paced {
            Some(decision) => decision,
            None => {
                let step = PacingStep {
                    sent_count: job.sent_count,
                    consecutive_failures: breaker.consecutive_failures(),
                    last_rest_at: rest_taken_at(&job),
                };
                let decision = pacing.next_delay(&config, &step);
                if decision.is_rest() {
                    tracing::info!(
                        "☕ Job {}: resting {}s after {} messages",
                        job_id,
                        decision.duration().as_secs(),
                        job.sent_count
                    );
                }
                if let Wait::Interrupted(status) = ctx.wait(job_id, decision.duration(), wake).await? {
                    return Ok(status);
                }
                paced = Some(decision);
                if !gate.allowed(ctx.clock.local_now()) {
                    continue;
                }
                decision
            }
        };
        if let Some(typing) = pacing.typing_delay(&config) {
            if let Wait::Interrupted(status) = ctx.wait(job_id, typing, wake).await? {
                return Ok(status);
            }
        }

        // 4. Quota, counted against the hour the send actually starts in.
        let index = job.current_index;
        let Some(target) = job.targets.get(index).cloned() else {
            continue;
        };
        let guard = ctx.locks.acquire(&channel_id).await;
        let now = ctx.clock.local_now();
        if !gate.allowed(now) {
            continue;
        }
        let limits = QuotaLimits::for_job(
            &config,
            job.started_at.map(|at| ctx.clock.to_local(at).date()),
            now.date(),
        );
        if let QuotaDecision::Exhausted { window, resume_at } = ctx.quotas.try_reserve(&channel_id, limits, now) {
            drop(guard);
            tracing::info!(
                "📉 Job {}: {:?} quota reached on {}, waiting until {}",
                job_id,
                window,
                channel_id,
                resume_at
            );
            if let Wait::Interrupted(status) = ctx.wait(job_id, ctx.clock.until(resume_at), wake).await? {
                return Ok(status);
            }
            continue;
        }

        // 5. Send
        if !ctx.claim(job_id, index)? {
            ctx.quotas.release(&channel_id, now);
            continue;
        }
        let attempted_at = ctx.clock.now();
        let outcome = ctx.send(&channel_id, &target).await;
        drop(guard);
        paced = None;

        // 6/7. Record
        let (status, error) = classify(outcome, &config);
        match status {
            LogStatus::Sent => {
                breaker.record_success();
                tracing::debug!("📤 Job {}: sent to {}", job_id, target.id);
            }
            LogStatus::Failed => {
                breaker.record_failure();
                tracing::warn!(
                    "⚠️ Job {}: send to {} failed: {}",
                    job_id,
                    target.id,
                    error.as_deref().unwrap_or("unknown error")
                );
            }
            LogStatus::Skipped => {
                tracing::info!(
                    "🚫 Job {}: {} is blocked, skipping ({})",
                    job_id,
                    target.id,
                    error.as_deref().unwrap_or("blocked")
                );
            }
        }
        let tripped = breaker.state() == BreakerState::Tripped;
        let entry = LogEntry {
            timestamp: attempted_at,
            target_id: target.id.clone(),
            target_name: target.display_name.clone(),
            status,
            error,
            delay_seconds: Some(decision.duration().as_secs_f64()),
        };
        let job = ctx.record_outcome(job_id, &entry, tripped).await?;

        // 8. Terminal?
        match job.status {
            JobStatus::Running => {}
            JobStatus::Failed => {
                tracing::warn!(
                    "🛑 Job {} failed: circuit breaker tripped after {} consecutive failures",
                    job_id,
                    breaker.consecutive_failures()
                );
                return Ok(job.status);
            }
            JobStatus::Completed => {
                log_completed(&job);
                return Ok(job.status);
            }
            other => {
                tracing::info!("⏸️ Job {} stopped dispatching ({})", job_id, other);
                return Ok(other);
            }
        }
    }
}
