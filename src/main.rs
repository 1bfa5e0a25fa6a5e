//! # Outreach — paced batch messaging for sales affiliates
//!
//! Usage:
//!   outreach run                         # Start the dispatcher daemon
//!   outreach create job.json             # Queue a job from a JSON request
//!   outreach list                        # List jobs with progress
//!   outreach pause <job-id>              # Pause / resume / cancel / delete
//!   outreach config                      # Print the effective configuration
//!
//! Control commands write straight to the job database; a running daemon
//! picks the change up within one poll interval.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use outreach_channels::ChannelRegistry;
use outreach_core::config::OutreachConfig;
use outreach_core::types::Target;
use outreach_scheduler::{
    AutomationJob, Clock, DispatchEngine, JobCommand, JobStatus, JobStore, NewJob, SqliteJobStore,
    SystemClock, apply_command, spawn_trigger,
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "outreach",
    version,
    about = "📨 Outreach — paced, quota-aware batch messaging"
)]
struct Cli {
    /// Config file (default: ~/.outreach/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher: recover unfinished jobs, then tick until Ctrl-C
    Run,
    /// Create a job from a JSON request file
    Create {
        file: PathBuf,
        /// Messaging channel, overriding the one in the file
        #[arg(long)]
        channel: Option<String>,
    },
    /// List jobs
    List {
        /// Only jobs in this status
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Show one job with its execution log
    Show {
        id: String,
        /// Print the raw job as JSON
        #[arg(long)]
        json: bool,
    },
    /// Attach a messaging channel to a pending or scheduled job
    Assign { id: String, channel: String },
    /// Start a pending job
    Start { id: String },
    /// Pause a running job
    Pause { id: String },
    /// Resume a paused job
    Resume { id: String },
    /// Cancel a job
    Cancel { id: String },
    /// Delete a finished job
    Delete { id: String },
    /// Print the effective configuration
    Config,
}

/// Job request file. `config` holds only the fields that differ from the
/// configured defaults.
#[derive(Deserialize)]
struct JobFile {
    affiliate_id: String,
    #[serde(default)]
    channel_id: Option<String>,
    targets: Vec<Target>,
    #[serde(default)]
    config: serde_json::Value,
}

fn load_config(path: Option<&str>) -> Result<OutreachConfig> {
    let config = match path {
        Some(p) => OutreachConfig::load_from(std::path::Path::new(&shellexpand::tilde(p).to_string()))?,
        None => OutreachConfig::load()?,
    };
    Ok(config)
}

fn open_store(config: &OutreachConfig) -> Result<SqliteJobStore> {
    let path = config.database_file();
    SqliteJobStore::open(&path).with_context(|| format!("opening job database {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "outreach=debug,outreach_scheduler=debug,outreach_channels=debug"
    } else {
        "outreach=info,outreach_scheduler=info,outreach_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Create { file, channel } => create(&config, &file, channel),
        Command::List { status } => list(&config, status),
        Command::Show { id, json } => show(&config, &id, json),
        Command::Assign { id, channel } => assign(&config, &id, &channel),
        Command::Start { id } => control(&config, &id, JobCommand::Start),
        Command::Pause { id } => control(&config, &id, JobCommand::Pause),
        Command::Resume { id } => control(&config, &id, JobCommand::Resume),
        Command::Cancel { id } => control(&config, &id, JobCommand::Cancel),
        Command::Delete { id } => {
            open_store(&config)?.delete(&id)?;
            println!("🗑️  Deleted {id}");
            Ok(())
        }
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: OutreachConfig) -> Result<()> {
    let store: Arc<dyn JobStore> = Arc::new(open_store(&config)?);
    let registry = ChannelRegistry::from_config(&config.channel);
    if registry.channel_ids().is_empty() {
        tracing::warn!("⚠️  No messaging channels configured; jobs will fail every send.");
    }

    let engine = Arc::new(DispatchEngine::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(SystemClock),
        &config.engine,
    ));

    // Pick up whatever was running or due before the last shutdown.
    let report = engine.tick()?;
    tracing::info!(
        "🚀 Dispatcher up: {} promoted, {} resumed, db {}",
        report.promoted.len(),
        report.adopted.len(),
        config.database_file().display()
    );

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(
                    "📣 {} {:?} [{}] sent={} failed={} skipped={}",
                    event.job_id,
                    event.kind,
                    event.status,
                    event.sent_count,
                    event.failed_count,
                    event.skipped_count
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("⚠️  Event log lagged, {n} events dropped")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let trigger = tokio::spawn(spawn_trigger(engine.clone(), config.engine.tick_interval_secs));

    tokio::signal::ctrl_c().await?;
    tracing::info!("👋 Shutting down");
    trigger.abort();
    engine.shutdown();
    Ok(())
}

fn create(config: &OutreachConfig, file: &std::path::Path, channel: Option<String>) -> Result<()> {
    let content = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let request: JobFile = serde_json::from_str(&content)?;
    let dispatch = config.defaults.overlay(&request.config)?;

    let now = SystemClock.now();
    let mut job = AutomationJob::create(
        NewJob {
            affiliate_id: request.affiliate_id,
            channel_id: channel.or(request.channel_id),
            targets: request.targets,
            config: dispatch,
        },
        now,
    )?;
    job.admit(now)?;
    open_store(config)?.insert(&job)?;

    println!("✅ Created {} ({} targets, {})", job.id, job.targets.len(), job.status);
    if job.status == JobStatus::Pending {
        println!("   No channel yet: outreach assign {} <channel-id>", job.id);
    }
    Ok(())
}

fn list(config: &OutreachConfig, status: Option<JobStatus>) -> Result<()> {
    let store = open_store(config)?;
    let jobs = match status {
        Some(s) => store.with_status(s)?,
        None => store.list()?,
    };
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "{:<42} {:<10} {:<12} {:>7} {:>5} {:>5} {:>5}",
        "ID", "STATUS", "CHANNEL", "DONE", "SENT", "FAIL", "SKIP"
    );
    for job in jobs {
        let s = job.summary();
        println!(
            "{:<42} {:<10} {:<12} {:>6.1}% {:>5} {:>5} {:>5}",
            s.id,
            s.status,
            s.channel_id.as_deref().unwrap_or("-"),
            s.progress_percent,
            s.sent,
            s.failed,
            s.skipped
        );
    }
    Ok(())
}

fn show(config: &OutreachConfig, id: &str, json: bool) -> Result<()> {
    let job = open_store(config)?.get(id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    let s = job.summary();
    println!("📋 {} — {}", s.id, s.status);
    println!("   Affiliate: {}", s.affiliate_id);
    println!("   Channel:   {}", s.channel_id.as_deref().unwrap_or("-"));
    println!(
        "   Progress:  {}/{} ({:.1}%), {} sent, {} failed, {} skipped",
        job.current_index, s.total, s.progress_percent, s.sent, s.failed, s.skipped
    );
    if let Some(err) = &s.last_error {
        println!("   Last error: {err}");
    }
    for (label, at) in [
        ("Scheduled", job.scheduled_at),
        ("Started", job.started_at),
        ("Paused", job.paused_at),
        ("Finished", job.completed_at),
    ] {
        if let Some(at) = at {
            println!("   {label:<10} {}", at.to_rfc3339());
        }
    }
    if !job.execution_log.is_empty() {
        println!();
        for entry in &job.execution_log {
            println!(
                "   {} {:<8} {:<20} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.status.as_str(),
                entry.target_id,
                entry.error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

fn assign(config: &OutreachConfig, id: &str, channel: &str) -> Result<()> {
    let now = SystemClock.now();
    let job = open_store(config)?.update(id, &mut |job: &mut AutomationJob| {
        job.assign_channel(channel)?;
        if job.status == JobStatus::Pending {
            job.admit(now)?;
        }
        Ok(())
    })?;
    println!("🔗 {} → {} ({})", job.id, channel, job.status);
    Ok(())
}

fn control(config: &OutreachConfig, id: &str, command: JobCommand) -> Result<()> {
    let store = open_store(config)?;
    let (job, changed) = apply_command(&store, id, command, SystemClock.now())?;
    if changed {
        println!("✅ {} is now {}", job.id, job.status);
    } else {
        println!("ℹ️  {} already {}", job.id, job.status);
    }
    Ok(())
}
