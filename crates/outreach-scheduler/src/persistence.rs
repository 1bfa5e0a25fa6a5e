//! SQLite-backed job store — survives restarts, shared by the daemon and the CLI.
//!
//! Execution-log rows are insert-only: an update writes the job row and
//! appends the new tail of the log, never touching earlier entries.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use outreach_core::error::{OutreachError, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tokio::sync::broadcast;

use crate::job::{AutomationJob, JobStatus, LogEntry};
use crate::notify::{JobEvent, JobNotifier};
use crate::store::{JobMutation, JobStore, ensure_deletable, mutate_copy};

const JOB_COLUMNS: &str = "id, affiliate_id, channel_id, targets, status, config, sent_count, \
     failed_count, skipped_count, current_index, current_target_id, attempt_in_flight, \
     scheduled_at, started_at, paused_at, completed_at, last_error, created_at, updated_at";

fn db_err(e: rusqlite::Error) -> OutreachError {
    OutreachError::Database(e.to_string())
}

/// Fixed-width RFC 3339 so text comparison orders like time.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| OutreachError::Database(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Raw `automation_jobs` row before decoding.
struct JobRow {
    id: String,
    affiliate_id: String,
    channel_id: Option<String>,
    targets: String,
    status: String,
    config: String,
    sent_count: u32,
    failed_count: u32,
    skipped_count: u32,
    current_index: i64,
    current_target_id: Option<String>,
    attempt_in_flight: bool,
    scheduled_at: Option<String>,
    started_at: Option<String>,
    paused_at: Option<String>,
    completed_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            affiliate_id: row.get(1)?,
            channel_id: row.get(2)?,
            targets: row.get(3)?,
            status: row.get(4)?,
            config: row.get(5)?,
            sent_count: row.get(6)?,
            failed_count: row.get(7)?,
            skipped_count: row.get(8)?,
            current_index: row.get(9)?,
            current_target_id: row.get(10)?,
            attempt_in_flight: row.get::<_, i32>(11)? != 0,
            scheduled_at: row.get(12)?,
            started_at: row.get(13)?,
            paused_at: row.get(14)?,
            completed_at: row.get(15)?,
            last_error: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn into_job(self, execution_log: Vec<LogEntry>) -> Result<AutomationJob> {
        Ok(AutomationJob {
            targets: serde_json::from_str(&self.targets)?,
            status: self.status.parse()?,
            config: serde_json::from_str(&self.config)?,
            sent_count: self.sent_count,
            failed_count: self.failed_count,
            skipped_count: self.skipped_count,
            current_index: usize::try_from(self.current_index)
                .map_err(|_| OutreachError::Database(format!("job {}: negative index", self.id)))?,
            current_target_id: self.current_target_id,
            attempt_in_flight: self.attempt_in_flight,
            scheduled_at: parse_opt_ts(self.scheduled_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            paused_at: parse_opt_ts(self.paused_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            last_error: self.last_error,
            execution_log,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            affiliate_id: self.affiliate_id,
            channel_id: self.channel_id,
        })
    }
}

/// SQLite-backed `JobStore`.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    notifier: JobNotifier,
}

impl SqliteJobStore {
    /// Open or create the job database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        // The daemon and CLI commands write the same file
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            notifier: JobNotifier::default(),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            -- One row per automation job
            CREATE TABLE IF NOT EXISTS automation_jobs (
                id TEXT PRIMARY KEY,
                affiliate_id TEXT NOT NULL,
                channel_id TEXT,
                targets TEXT NOT NULL,            -- JSON array of targets
                status TEXT NOT NULL DEFAULT 'pending',
                config TEXT NOT NULL,             -- JSON DispatchConfig snapshot
                sent_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                skipped_count INTEGER NOT NULL DEFAULT 0,
                current_index INTEGER NOT NULL DEFAULT 0,
                current_target_id TEXT,
                attempt_in_flight INTEGER NOT NULL DEFAULT 0,
                scheduled_at TEXT,
                started_at TEXT,
                paused_at TEXT,
                completed_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status
                ON automation_jobs(status, scheduled_at);

            -- Append-only execution log
            CREATE TABLE IF NOT EXISTS job_log_entries (
                job_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                target_id TEXT NOT NULL,
                target_name TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,             -- 'sent', 'failed', 'skipped'
                error TEXT,
                delay_seconds REAL,
                PRIMARY KEY (job_id, seq)
            );
         ",
            )
            .map_err(|e| OutreachError::Database(format!("Migration: {e}")))
    }

    fn load(conn: &Connection, id: &str) -> Result<Option<AutomationJob>> {
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM automation_jobs WHERE id = ?1"),
                params![id],
                JobRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let log = Self::load_log(conn, id)?;
                row.into_job(log).map(Some)
            }
            None => Ok(None),
        }
    }

    fn load_where(conn: &Connection, clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<AutomationJob>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM automation_jobs {clause} ORDER BY created_at, id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(args, JobRow::from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let log = Self::load_log(conn, &row.id)?;
                row.into_job(log)
            })
            .collect()
    }

    fn load_log(conn: &Connection, job_id: &str) -> Result<Vec<LogEntry>> {
        let mut stmt = conn
            .prepare(
                "SELECT timestamp, target_id, target_name, status, error, delay_seconds
                 FROM job_log_entries WHERE job_id = ?1 ORDER BY seq",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(timestamp, target_id, target_name, status, error, delay_seconds)| {
                Ok(LogEntry {
                    timestamp: parse_ts(&timestamp)?,
                    target_id,
                    target_name,
                    status: status.parse()?,
                    error,
                    delay_seconds,
                })
            })
            .collect()
    }

    fn write_job(conn: &Connection, job: &AutomationJob) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO automation_jobs ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
            ),
            params![
                job.id,
                job.affiliate_id,
                job.channel_id,
                serde_json::to_string(&job.targets)?,
                job.status.as_str(),
                serde_json::to_string(&job.config)?,
                job.sent_count,
                job.failed_count,
                job.skipped_count,
                job.current_index as i64,
                job.current_target_id,
                job.attempt_in_flight as i32,
                job.scheduled_at.as_ref().map(ts),
                job.started_at.as_ref().map(ts),
                job.paused_at.as_ref().map(ts),
                job.completed_at.as_ref().map(ts),
                job.last_error,
                ts(&job.created_at),
                ts(&job.updated_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Insert log entries from position `from` onwards.
    fn append_log(conn: &Connection, job: &AutomationJob, from: usize) -> Result<()> {
        let mut stmt = conn
            .prepare(
                "INSERT INTO job_log_entries
                 (job_id, seq, timestamp, target_id, target_name, status, error, delay_seconds)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(db_err)?;
        for (seq, entry) in job.execution_log.iter().enumerate().skip(from) {
            stmt.execute(params![
                job.id,
                seq as i64,
                ts(&entry.timestamp),
                entry.target_id,
                entry.target_name,
                entry.status.as_str(),
                entry.error,
                entry.delay_seconds,
            ])
            .map_err(db_err)?;
        }
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn insert(&self, job: &AutomationJob) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let exists: Option<String> = tx
            .query_row("SELECT id FROM automation_jobs WHERE id = ?1", params![job.id], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        if exists.is_some() {
            return Err(OutreachError::Database(format!("job {} already exists", job.id)));
        }
        Self::write_job(&tx, job)?;
        Self::append_log(&tx, job, 0)?;
        tx.commit().map_err(db_err)?;
        drop(conn);

        tracing::debug!("💾 Job {} stored", job.id);
        self.notifier.created(job);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<AutomationJob> {
        Self::load(&self.conn(), id)?.ok_or_else(|| OutreachError::JobNotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<AutomationJob>> {
        Self::load_where(&self.conn(), "", &[])
    }

    fn with_status(&self, status: JobStatus) -> Result<Vec<AutomationJob>> {
        Self::load_where(&self.conn(), "WHERE status = ?1", &[&status.as_str()])
    }

    fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<AutomationJob>> {
        Self::load_where(
            &self.conn(),
            "WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?1",
            &[&ts(&now)],
        )
    }

    fn update(&self, id: &str, mutate: JobMutation<'_>) -> Result<AutomationJob> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let current = Self::load(&tx, id)?.ok_or_else(|| OutreachError::JobNotFound(id.to_string()))?;

        let Some(next) = mutate_copy(&current, mutate)? else {
            return Ok(current);
        };
        Self::write_job(&tx, &next)?;
        Self::append_log(&tx, &next, current.execution_log.len())?;
        tx.commit().map_err(db_err)?;
        drop(conn);

        self.notifier.updated(&current, &next);
        Ok(next)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let job = Self::load(&tx, id)?.ok_or_else(|| OutreachError::JobNotFound(id.to_string()))?;
        ensure_deletable(&job)?;
        tx.execute("DELETE FROM job_log_entries WHERE job_id = ?1", params![id])
            .map_err(db_err)?;
        tx.execute("DELETE FROM automation_jobs WHERE id = ?1", params![id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        drop(conn);

        tracing::info!("🗑️ Job deleted: {id}");
        self.notifier.deleted(&job);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobCommand, LogStatus, NewJob};
    use crate::store::apply_command;
    use outreach_core::config::{DispatchConfig, ScheduleType};
    use outreach_core::types::Target;

    fn temp_db(name: &str) -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("outreach-{name}-{}", uuid::Uuid::new_v4()))
            .join("jobs.db")
    }

    fn job(n: usize) -> AutomationJob {
        AutomationJob::create(
            NewJob {
                affiliate_id: "aff-7".into(),
                channel_id: Some("wa-main".into()),
                targets: (0..n)
                    .map(|i| Target::new(format!("+8490{i}"), format!("Cafe {i}"), "Xin chào"))
                    .collect(),
                config: DispatchConfig {
                    daily_limit: 25,
                    ..Default::default()
                },
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn entry(target: &str, status: LogStatus) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            target_id: target.into(),
            target_name: "Cafe".into(),
            status,
            error: (status == LogStatus::Failed).then(|| "timeout".to_string()),
            delay_seconds: Some(61.25),
        }
    }

    #[test]
    fn test_two_connections_update_concurrently() {
        let path = temp_db("two-conns");
        let daemon = std::sync::Arc::new(SqliteJobStore::open(&path).unwrap());
        let cli = std::sync::Arc::new(SqliteJobStore::open(&path).unwrap());

        let mut j = job(400);
        j.start(Utc::now()).unwrap();
        daemon.insert(&j).unwrap();

        let writers: Vec<_> = [daemon.clone(), cli.clone()]
            .into_iter()
            .map(|store| {
                let id = j.id.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|_| {
                            store
                                .update(&id, &mut |job: &mut AutomationJob| {
                                    let target = job.targets[job.current_index].id.clone();
                                    job.record(entry(&target, LogStatus::Sent));
                                    Ok(())
                                })
                                .is_err()
                        })
                        .count()
                })
            })
            .collect();
        let failures: usize = writers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(failures, 0);

        let loaded = cli.get(&j.id).unwrap();
        assert_eq!(loaded.current_index, 400);
        assert_eq!(loaded.sent_count, 400);
        assert_eq!(loaded.execution_log.len(), 400);
        let ids: Vec<_> = loaded.execution_log.iter().map(|e| e.target_id.clone()).collect();
        let expected: Vec<_> = loaded.targets.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, expected);

        drop((daemon, cli));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_open_and_migrate() {
        let path = temp_db("migrate");
        let store = SqliteJobStore::open(&path).unwrap();
        assert!(store.list().unwrap().is_empty());
        drop(store);
        // Re-opening runs migrations again without error.
        SqliteJobStore::open(&path).unwrap();
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_save_and_load_job() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let mut j = job(3);
        j.start(Utc::now()).unwrap();
        store.insert(&j).unwrap();

        let loaded = store.get(&j.id).unwrap();
        assert_eq!(loaded, j);
        assert_eq!(loaded.config.daily_limit, 25);
        assert_eq!(loaded.targets[1].display_name, "Cafe 1");
    }

    #[test]
    fn test_update_appends_log_rows() {
        let path = temp_db("append");
        let store = SqliteJobStore::open(&path).unwrap();
        let mut j = job(3);
        j.start(Utc::now()).unwrap();
        store.insert(&j).unwrap();

        for (target, status) in [("+84900", LogStatus::Sent), ("+84901", LogStatus::Failed)] {
            store
                .update(&j.id, &mut |job: &mut AutomationJob| {
                    job.begin_attempt();
                    job.record(entry(target, status));
                    Ok(())
                })
                .unwrap();
        }
        drop(store);

        // Fresh connection sees the committed state.
        let store = SqliteJobStore::open(&path).unwrap();
        let loaded = store.get(&j.id).unwrap();
        assert_eq!(loaded.current_index, 2);
        assert_eq!((loaded.sent_count, loaded.failed_count), (1, 1));
        assert_eq!(loaded.last_error.as_deref(), Some("timeout"));
        assert_eq!(loaded.current_target_id.as_deref(), Some("+84902"));
        assert!(!loaded.attempt_in_flight);
        let order: Vec<&str> = loaded.execution_log.iter().map(|e| e.target_id.as_str()).collect();
        assert_eq!(order, vec!["+84900", "+84901"]);
        assert_eq!(loaded.execution_log[0].delay_seconds, Some(61.25));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_rejects_log_rewrite() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let j = job(2);
        store.insert(&j).unwrap();
        store
            .update(&j.id, &mut |job: &mut AutomationJob| {
                job.record(entry("+84900", LogStatus::Sent));
                Ok(())
            })
            .unwrap();

        let result = store.update(&j.id, &mut |job: &mut AutomationJob| {
            job.execution_log[0].status = LogStatus::Skipped;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.get(&j.id).unwrap().execution_log[0].status, LogStatus::Sent);
    }

    #[test]
    fn test_due_scheduled_and_status_query() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut ids = Vec::new();
        for offset in [-5, 30] {
            let mut j = job(1);
            j.config.schedule_type = ScheduleType::Scheduled;
            j.config.scheduled_at = Some(now + chrono::Duration::minutes(offset));
            j.schedule().unwrap();
            store.insert(&j).unwrap();
            ids.push(j.id);
        }

        let due = store.due_scheduled(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, ids[0]);
        assert_eq!(store.with_status(JobStatus::Scheduled).unwrap().len(), 2);
        assert!(store.with_status(JobStatus::Running).unwrap().is_empty());
    }

    #[test]
    fn test_delete_terminal_only() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let j = job(1);
        store.insert(&j).unwrap();
        store
            .update(&j.id, &mut |job: &mut AutomationJob| {
                job.record(entry("+84900", LogStatus::Sent));
                Ok(())
            })
            .unwrap();
        assert!(matches!(store.delete(&j.id), Err(OutreachError::JobActive(_))));

        let (cancelled, _) = apply_command(&store, &j.id, JobCommand::Cancel, Utc::now()).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        store.delete(&j.id).unwrap();
        assert!(matches!(store.get(&j.id), Err(OutreachError::JobNotFound(_))));

        // Log rows went with it.
        let orphans: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM job_log_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }
}
