//! Dispatch engine — the control surface and the trigger loop.
//! Owns one dispatch loop per running job; everything else lives in the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outreach_core::config::EngineConfig;
use outreach_core::error::Result;
use outreach_core::traits::SendChannel;
use serde::Serialize;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::dispatch::{ChannelLocks, DispatchContext, run_job};
use crate::job::{AutomationJob, JobCommand, JobStatus, NewJob};
use crate::notify::JobEvent;
use crate::pacing::PacingEngine;
use crate::quota::{QuotaManager, QuotaState};
use crate::store::{JobStore, apply_command};

struct LoopHandle {
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

/// What one trigger tick did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TickReport {
    /// Scheduled jobs moved to running.
    pub promoted: Vec<String>,
    /// Running jobs that had no live loop and got one.
    pub adopted: Vec<String>,
    /// Scheduled jobs that could not start.
    pub failed: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.adopted.is_empty() && self.failed.is_empty()
    }
}

/// The dispatch engine — manages jobs and drives their loops.
pub struct DispatchEngine {
    ctx: Arc<DispatchContext>,
    loops: Mutex<HashMap<String, LoopHandle>>,
    rng_seed: Option<u64>,
    spawned: AtomicU64,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        channel: Arc<dyn SendChannel>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        let ctx = DispatchContext {
            store,
            channel,
            clock,
            quotas: Arc::new(QuotaManager::new()),
            locks: Arc::new(ChannelLocks::new()),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        };
        Self {
            ctx: Arc::new(ctx),
            loops: Mutex::new(HashMap::new()),
            rng_seed: config.rng_seed,
            spawned: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.ctx.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.ctx.store.subscribe()
    }

    fn loops(&self) -> std::sync::MutexGuard<'_, HashMap<String, LoopHandle>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a job from a request. Immediate jobs with a channel start
    /// right away; scheduled jobs wait for the trigger.
    pub fn create_job(&self, request: NewJob) -> Result<AutomationJob> {
        let now = self.ctx.clock.now();
        let mut job = AutomationJob::create(request, now)?;
        job.admit(now)?;
        self.ctx.store.insert(&job)?;
        tracing::info!(
            "📋 Job created: {} ({} targets, {})",
            job.id,
            job.targets.len(),
            job.status
        );
        if job.status == JobStatus::Running {
            self.ensure_loop(&job.id);
        }
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<AutomationJob> {
        self.ctx.store.get(id)
    }

    pub fn list(&self) -> Result<Vec<AutomationJob>> {
        self.ctx.store.list()
    }

    /// Attach a channel to a pending or scheduled job. A pending immediate
    /// job starts as soon as it has one.
    pub fn assign_channel(&self, id: &str, channel_id: &str) -> Result<AutomationJob> {
        let now = self.ctx.clock.now();
        let job = self.ctx.store.update(id, &mut |job: &mut AutomationJob| {
            job.assign_channel(channel_id)?;
            if job.status == JobStatus::Pending {
                job.admit(now)?;
            }
            Ok(())
        })?;
        tracing::info!("🔗 Job {} assigned to channel {}", id, channel_id);
        if job.status == JobStatus::Running {
            self.ensure_loop(id);
        }
        Ok(job)
    }

    pub fn start(&self, id: &str) -> Result<AutomationJob> {
        self.command(id, JobCommand::Start)
    }

    /// Takes effect once the in-flight send (if any) settles.
    pub fn pause(&self, id: &str) -> Result<AutomationJob> {
        self.command(id, JobCommand::Pause)
    }

    pub fn resume(&self, id: &str) -> Result<AutomationJob> {
        self.command(id, JobCommand::Resume)
    }

    pub fn cancel(&self, id: &str) -> Result<AutomationJob> {
        self.command(id, JobCommand::Cancel)
    }

    fn command(&self, id: &str, command: JobCommand) -> Result<AutomationJob> {
        let (job, changed) = apply_command(self.ctx.store.as_ref(), id, command, self.ctx.clock.now())?;
        if changed {
            tracing::info!("🎛️ Job {}: {:?} → {}", id, command, job.status);
        }
        if job.status == JobStatus::Running {
            self.ensure_loop(id);
        } else {
            self.wake(id);
        }
        Ok(job)
    }

    /// Delete a terminal job.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.ctx.store.delete(id)?;
        if let Some(handle) = self.loops().remove(id) {
            handle.task.abort();
        }
        Ok(())
    }

    /// Current quota counters of a messaging channel.
    pub fn quota_usage(&self, channel_id: &str) -> QuotaState {
        self.ctx.quotas.usage(channel_id, self.ctx.clock.local_now())
    }

    /// Number of dispatch loops still alive.
    pub fn active_loops(&self) -> usize {
        self.loops().values().filter(|h| !h.task.is_finished()).count()
    }

    fn wake(&self, id: &str) {
        if let Some(handle) = self.loops().get(id) {
            handle.wake.notify_one();
        }
    }

    /// Spawn a dispatch loop for `id` unless one is alive already.
    /// Returns whether a new loop was spawned.
    fn ensure_loop(&self, id: &str) -> bool {
        let mut loops = self.loops();
        if let Some(handle) = loops.get(id) {
            if !handle.task.is_finished() {
                handle.wake.notify_one();
                return false;
            }
        }

        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let seed = self.rng_seed.map(|s| s.wrapping_add(n));
        let wake = Arc::new(Notify::new());
        let ctx = self.ctx.clone();
        let job_id = id.to_string();
        let loop_wake = wake.clone();

        let task = tokio::spawn(async move {
            let mut pacing = PacingEngine::new(seed);
            match run_job(&ctx, &job_id, &loop_wake, &mut pacing).await {
                Ok(status) => tracing::debug!("🏁 Loop for {} exited ({})", job_id, status),
                Err(e) => tracing::warn!("⚠️ Loop for {} aborted: {}", job_id, e),
            }
        });
        loops.insert(id.to_string(), LoopHandle { wake, task });
        true
    }

    /// Tick — promote due scheduled jobs, adopt running jobs without a loop,
    /// and forget finished loops.
    pub fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let now = self.ctx.clock.now();

        for job in self.ctx.store.due_scheduled(now)? {
            let updated = self.ctx.store.update(&job.id, &mut |j: &mut AutomationJob| {
                if j.status != JobStatus::Scheduled {
                    return Ok(());
                }
                if j.channel_id.is_some() {
                    j.start(now)
                } else {
                    j.fail(now, "no messaging channel assigned by scheduled start")
                }
            })?;
            match updated.status {
                JobStatus::Running => {
                    tracing::info!("🔔 Scheduled job {} started", updated.id);
                    report.promoted.push(updated.id);
                }
                JobStatus::Failed => {
                    tracing::warn!("⚠️ Scheduled job {} failed to start: no channel", updated.id);
                    report.failed.push(updated.id);
                }
                _ => {}
            }
        }

        for job in self.ctx.store.with_status(JobStatus::Running)? {
            if self.ensure_loop(&job.id) && !report.promoted.contains(&job.id) {
                tracing::info!("♻️ Adopted running job {} ({}/{})", job.id, job.current_index, job.targets.len());
                report.adopted.push(job.id);
            }
        }

        self.loops().retain(|_, h| !h.task.is_finished());
        Ok(report)
    }

    /// Stop every loop. In-flight attempts are left marked and get
    /// recorded as interrupted on the next start.
    pub fn shutdown(&self) {
        for (id, handle) in self.loops().drain() {
            tracing::debug!("Stopping loop for {id}");
            handle.task.abort();
        }
    }
}

/// Spawn the trigger loop: ticks the engine every `tick_interval_secs`.
pub async fn spawn_trigger(engine: Arc<DispatchEngine>, tick_interval_secs: u64) {
    tracing::info!("⏰ Trigger started (tick every {}s)", tick_interval_secs);

    let mut interval = tokio::time::interval(Duration::from_secs(tick_interval_secs.max(1)));

    loop {
        interval.tick().await;

        match engine.tick() {
            Ok(report) if !report.is_empty() => tracing::debug!("⏰ Tick: {:?}", report),
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️ Tick failed: {e}"),
        }
    }
}
