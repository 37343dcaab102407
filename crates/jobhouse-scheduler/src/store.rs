use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    db::{fmt_ts, init_db, parse_ts},
    error::{Result, SchedulerError},
    types::{Job, JobState, RecurringJobDefinition, Statistics, TransitionPatch},
};

/// How a recurring definition is being materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialize {
    /// Scheduled firing evaluated at `now`. Only fires if the definition's
    /// `next_execution` still equals `expected` (another dispatcher has not
    /// fired it yet), then moves `next_execution` to `next` and stamps
    /// `last_execution` with `now`.
    Due {
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    /// Administrative trigger. Leaves `next_execution` untouched.
    Trigger,
}

/// Durable record of every job and recurring definition.
///
/// The store is the only component that mutates records. Every state change
/// goes through [`JobStore::transition`], which is atomic per job.
pub trait JobStore: Send + Sync {
    /// Create a job in `Enqueued`.
    fn enqueue(&self, job_type: &str, payload: &str) -> Result<Job>;

    /// Create a job in `Scheduled` that becomes ready at `at`.
    fn schedule(&self, job_type: &str, payload: &str, at: DateTime<Utc>) -> Result<Job>;

    /// Move `id` to `to` if its current state is one of `from`.
    ///
    /// Fails with `NotFound` if the job is gone and `InvalidTransition` if it is
    /// in any other state.
    fn transition(
        &self,
        id: &str,
        from: &[JobState],
        to: JobState,
        patch: TransitionPatch,
    ) -> Result<Job>;

    fn get(&self, id: &str) -> Result<Job>;

    /// Newest first by `created_at`, optionally restricted to one state.
    fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>>;

    /// Jobs ready to run now: `Enqueued`, or `Scheduled` with `scheduled_for <= now`.
    /// Oldest `created_at` first, ties broken by id. Undecodable rows are
    /// skipped without counting against `limit`.
    fn ready_jobs(&self, limit: usize) -> Result<Vec<Job>>;

    /// Remove a job in any state. Returns whether it existed.
    fn delete(&self, id: &str) -> Result<bool>;

    fn statistics(&self) -> Result<Statistics>;

    /// Insert or replace a recurring definition. An existing definition keeps
    /// its `created_at` and `last_execution`, and keeps its `next_execution`
    /// unless the cron expression changed.
    fn upsert_recurring(&self, def: &RecurringJobDefinition) -> Result<RecurringJobDefinition>;

    fn get_recurring(&self, id: &str) -> Result<Option<RecurringJobDefinition>>;

    /// All definitions ordered by id.
    fn list_recurring(&self) -> Result<Vec<RecurringJobDefinition>>;

    fn remove_recurring(&self, id: &str) -> Result<bool>;

    /// Definitions whose `next_execution <= now`.
    fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJobDefinition>>;

    /// Atomically enqueue an instance of definition `id` and stamp
    /// `last_execution`. Returns `None` if the definition no longer exists or
    /// a `Due` firing was already taken.
    fn materialize_recurring(&self, id: &str, how: Materialize) -> Result<Option<Job>>;
}

/// [`JobStore`] backed by a single SQLite connection.
///
/// The connection sits behind a `Mutex` and every mutation runs inside an
/// `IMMEDIATE` transaction with a compare-on-state `UPDATE`, so transitions
/// stay linearizable even when several processes share the database file.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

const JOB_COLUMNS: &str = "id, job_type, payload, state, created_at, started_at, completed_at,
     retry_count, exception, scheduled_for, recurring_id";

const RECURRING_COLUMNS: &str =
    "id, cron_expression, job_type, payload, created_at, last_execution, next_execution";

impl SqliteJobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        info!(path = %path.as_ref().display(), "job store opened");
        Self::new(conn, clock)
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::new(Connection::open_in_memory()?, clock)
    }

    // SQLite stores microseconds; truncate up front so returned records
    // compare equal to what a later read yields.
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(6)
    }

    fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().expect("job store poisoned");
        insert_job_row(&conn, job)
    }
}

impl JobStore for SqliteJobStore {
    fn enqueue(&self, job_type: &str, payload: &str) -> Result<Job> {
        let job = Job::new_enqueued(Uuid::now_v7().to_string(), job_type, payload, self.now());
        self.insert_job(&job)?;
        info!(job_id = %job.id, %job_type, "job enqueued");
        Ok(job)
    }

    fn schedule(&self, job_type: &str, payload: &str, at: DateTime<Utc>) -> Result<Job> {
        let mut job = Job::new_enqueued(Uuid::now_v7().to_string(), job_type, payload, self.now());
        job.state = JobState::Scheduled;
        job.scheduled_for = Some(at.trunc_subsecs(6));
        self.insert_job(&job)?;
        info!(job_id = %job.id, %job_type, at = %at, "job scheduled");
        Ok(job)
    }

    #[instrument(skip(self, patch))]
    fn transition(
        &self,
        id: &str,
        from: &[JobState],
        to: JobState,
        patch: TransitionPatch,
    ) -> Result<Job> {
        let mut conn = self.conn.lock().expect("job store poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = select_job(&tx, id)?.ok_or_else(|| SchedulerError::NotFound {
            id: id.to_string(),
        })?;
        if !from.contains(&current.state) {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from: current.state,
                to,
            });
        }

        let next = current.apply(to, &truncate_patch(patch));
        let n = tx.execute(
            "UPDATE jobs SET state=?1, started_at=?2, completed_at=?3, retry_count=?4,
                    exception=?5, scheduled_for=?6
             WHERE id=?7 AND state=?8",
            rusqlite::params![
                next.state.as_str(),
                next.started_at.map(fmt_ts),
                next.completed_at.map(fmt_ts),
                next.retry_count,
                next.exception,
                next.scheduled_for.map(fmt_ts),
                id,
                current.state.as_str(),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from: current.state,
                to,
            });
        }
        tx.commit()?;

        debug!(job_id = %id, from = %current.state, "job transitioned");
        Ok(next)
    }

    fn get(&self, id: &str) -> Result<Job> {
        let conn = self.conn.lock().expect("job store poisoned");
        select_job(&conn, id)?.ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })
    }

    fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn.lock().expect("job store poisoned");
        let limit = clamp_limit(limit);
        let rows = match state {
            Some(state) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![state.as_str(), limit], JobRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map([limit], JobRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(decode_rows(rows))
    }

    fn ready_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = fmt_ts(self.now());
        let conn = self.conn.lock().expect("job store poisoned");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE state = 'enqueued'
                OR (state = 'scheduled' AND scheduled_for IS NOT NULL AND scheduled_for <= ?1)
             ORDER BY created_at ASC, id ASC"
        ))?;
        let mut ready = Vec::with_capacity(limit);
        for row in stmt.query_map([now], JobRow::read)? {
            match row?.decode() {
                Ok(job) => ready.push(job),
                Err(e) => warn!("skipping job row: {e}"),
            }
            if ready.len() == limit {
                break;
            }
        }
        Ok(ready)
    }

    #[instrument(skip(self))]
    fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("job store poisoned");
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n > 0 {
            info!(job_id = %id, "job deleted");
        }
        Ok(n > 0)
    }

    fn statistics(&self) -> Result<Statistics> {
        let mut conn = self.conn.lock().expect("job store poisoned");
        // One read transaction so all counts come from the same snapshot.
        let tx = conn.transaction()?;
        let mut stats = Statistics::default();
        {
            let mut stmt = tx.prepare_cached("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
            let counts = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (state, n) in counts {
                match state.parse::<JobState>() {
                    Ok(state) => stats.set_count(state, n as u64),
                    Err(e) => warn!("statistics: {e}"),
                }
            }
        }
        stats.recurring =
            tx.query_row("SELECT COUNT(*) FROM recurring_jobs", [], |row| row.get::<_, i64>(0))?
                as u64;
        let (oldest, newest): (Option<String>, Option<String>) = tx.query_row(
            "SELECT MIN(created_at), MAX(completed_at) FROM jobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        stats.oldest_job = oldest.and_then(|s| parse_ts(&s).ok());
        stats.last_completion = newest.and_then(|s| parse_ts(&s).ok());
        tx.commit()?;
        Ok(stats)
    }

    #[instrument(skip(self, def), fields(recurring_id = %def.id))]
    fn upsert_recurring(&self, def: &RecurringJobDefinition) -> Result<RecurringJobDefinition> {
        let mut conn = self.conn.lock().expect("job store poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO recurring_jobs
             (id, cron_expression, job_type, payload, created_at, last_execution, next_execution)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                cron_expression = excluded.cron_expression,
                job_type        = excluded.job_type,
                payload         = excluded.payload,
                next_execution  = CASE
                    WHEN recurring_jobs.cron_expression = excluded.cron_expression
                    THEN recurring_jobs.next_execution
                    ELSE excluded.next_execution
                END",
            rusqlite::params![
                def.id,
                def.cron_expression,
                def.job_type,
                def.payload,
                fmt_ts(def.created_at.trunc_subsecs(6)),
                def.last_execution.map(|t| fmt_ts(t.trunc_subsecs(6))),
                fmt_ts(def.next_execution.trunc_subsecs(6)),
            ],
        )?;
        let stored = select_recurring(&tx, &def.id)?.ok_or_else(|| SchedulerError::NotFound {
            id: def.id.clone(),
        })?;
        tx.commit()?;
        Ok(stored)
    }

    fn get_recurring(&self, id: &str) -> Result<Option<RecurringJobDefinition>> {
        let conn = self.conn.lock().expect("job store poisoned");
        select_recurring(&conn, id)
    }

    fn list_recurring(&self) -> Result<Vec<RecurringJobDefinition>> {
        let conn = self.conn.lock().expect("job store poisoned");
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {RECURRING_COLUMNS} FROM recurring_jobs ORDER BY id"))?;
        let rows = stmt
            .query_map([], RecurringRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_recurring_rows(rows))
    }

    #[instrument(skip(self))]
    fn remove_recurring(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("job store poisoned");
        let n = conn.execute("DELETE FROM recurring_jobs WHERE id = ?1", [id])?;
        if n > 0 {
            info!(recurring_id = %id, "recurring job removed");
        }
        Ok(n > 0)
    }

    fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJobDefinition>> {
        let now = fmt_ts(now.trunc_subsecs(6));
        let conn = self.conn.lock().expect("job store poisoned");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RECURRING_COLUMNS} FROM recurring_jobs
             WHERE next_execution <= ?1 ORDER BY next_execution, id"
        ))?;
        let rows = stmt
            .query_map([now], RecurringRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_recurring_rows(rows))
    }

    #[instrument(skip(self))]
    fn materialize_recurring(&self, id: &str, how: Materialize) -> Result<Option<Job>> {
        let now = match how {
            Materialize::Due { now, .. } => now.trunc_subsecs(6),
            Materialize::Trigger => self.now(),
        };
        let mut conn = self.conn.lock().expect("job store poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(def) = select_recurring(&tx, id)? else {
            return Ok(None);
        };
        let next_execution = match how {
            Materialize::Due { expected, next, .. } => {
                if def.next_execution != expected.trunc_subsecs(6) {
                    debug!(recurring_id = %id, "recurring firing already taken");
                    return Ok(None);
                }
                next.trunc_subsecs(6)
            }
            Materialize::Trigger => def.next_execution,
        };

        let mut job = Job::new_enqueued(Uuid::now_v7().to_string(), &def.job_type, &def.payload, now);
        job.recurring_id = Some(def.id.clone());
        insert_job_row(&tx, &job)?;
        tx.execute(
            "UPDATE recurring_jobs SET last_execution = ?1, next_execution = ?2 WHERE id = ?3",
            rusqlite::params![fmt_ts(now), fmt_ts(next_execution), id],
        )?;
        tx.commit()?;
        Ok(Some(job))
    }
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn truncate_patch(patch: TransitionPatch) -> TransitionPatch {
    TransitionPatch {
        started_at: patch.started_at.map(|t| t.trunc_subsecs(6)),
        completed_at: patch.completed_at.map(|t| t.trunc_subsecs(6)),
        scheduled_for: patch.scheduled_for.map(|t| t.trunc_subsecs(6)),
        ..patch
    }
}

fn insert_job_row(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs
         (id, job_type, payload, state, created_at, started_at, completed_at,
          retry_count, exception, scheduled_for, recurring_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            job.id,
            job.job_type,
            job.payload,
            job.state.as_str(),
            fmt_ts(job.created_at),
            job.started_at.map(fmt_ts),
            job.completed_at.map(fmt_ts),
            job.retry_count,
            job.exception,
            job.scheduled_for.map(fmt_ts),
            job.recurring_id,
        ],
    )?;
    Ok(())
}

fn select_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            JobRow::read,
        )
        .optional()?;
    row.map(JobRow::decode).transpose()
}

fn select_recurring(conn: &Connection, id: &str) -> Result<Option<RecurringJobDefinition>> {
    let row = conn
        .query_row(
            &format!("SELECT {RECURRING_COLUMNS} FROM recurring_jobs WHERE id = ?1"),
            [id],
            RecurringRow::read,
        )
        .optional()?;
    row.map(RecurringRow::decode).transpose()
}

// Rows that fail to decode are logged and skipped so one bad record cannot
// hide the rest of a listing.
fn decode_rows(rows: Vec<JobRow>) -> Vec<Job> {
    rows.into_iter()
        .filter_map(|row| match row.decode() {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("skipping job row: {e}");
                None
            }
        })
        .collect()
}

fn decode_recurring_rows(rows: Vec<RecurringRow>) -> Vec<RecurringJobDefinition> {
    rows.into_iter()
        .filter_map(|row| match row.decode() {
            Ok(def) => Some(def),
            Err(e) => {
                warn!("skipping recurring row: {e}");
                None
            }
        })
        .collect()
}

/// Raw column values as stored; decoded separately so bad data surfaces as
/// `CorruptRecord` instead of a driver error.
struct JobRow {
    id: String,
    job_type: String,
    payload: String,
    state: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    retry_count: u32,
    exception: Option<String>,
    scheduled_for: Option<String>,
    recurring_id: Option<String>,
}

impl JobRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_type: row.get(1)?,
            payload: row.get(2)?,
            state: row.get(3)?,
            created_at: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            retry_count: row.get(7)?,
            exception: row.get(8)?,
            scheduled_for: row.get(9)?,
            recurring_id: row.get(10)?,
        })
    }

    fn decode(self) -> Result<Job> {
        let id = self.id;
        let corrupt = |reason: String| SchedulerError::CorruptRecord {
            id: id.clone(),
            reason,
        };
        let opt_ts = |raw: Option<String>| raw.as_deref().map(parse_ts).transpose();

        Ok(Job {
            state: self.state.parse().map_err(corrupt)?,
            created_at: parse_ts(&self.created_at).map_err(corrupt)?,
            started_at: opt_ts(self.started_at).map_err(corrupt)?,
            completed_at: opt_ts(self.completed_at).map_err(corrupt)?,
            scheduled_for: opt_ts(self.scheduled_for).map_err(corrupt)?,
            job_type: self.job_type,
            payload: self.payload,
            retry_count: self.retry_count,
            exception: self.exception,
            recurring_id: self.recurring_id,
            id,
        })
    }
}

struct RecurringRow {
    id: String,
    cron_expression: String,
    job_type: String,
    payload: String,
    created_at: String,
    last_execution: Option<String>,
    next_execution: String,
}

impl RecurringRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            cron_expression: row.get(1)?,
            job_type: row.get(2)?,
            payload: row.get(3)?,
            created_at: row.get(4)?,
            last_execution: row.get(5)?,
            next_execution: row.get(6)?,
        })
    }

    fn decode(self) -> Result<RecurringJobDefinition> {
        let id = self.id;
        let corrupt = |reason: String| SchedulerError::CorruptRecord {
            id: id.clone(),
            reason,
        };
        Ok(RecurringJobDefinition {
            created_at: parse_ts(&self.created_at).map_err(corrupt)?,
            last_execution: self
                .last_execution
                .as_deref()
                .map(parse_ts)
                .transpose()
                .map_err(corrupt)?,
            next_execution: parse_ts(&self.next_execution).map_err(corrupt)?,
            cron_expression: self.cron_expression,
            job_type: self.job_type,
            payload: self.payload,
            id,
        })
    }
}
