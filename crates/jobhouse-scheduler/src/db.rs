use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `recurring_jobs` tables (idempotent) plus the
/// indexes the dispatcher's ready-job query and the newest-first listing use.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id             TEXT    NOT NULL PRIMARY KEY,
            job_type       TEXT    NOT NULL,
            payload        TEXT    NOT NULL,   -- opaque JSON handed to the handler
            state          TEXT    NOT NULL DEFAULT 'enqueued',
            created_at     TEXT    NOT NULL,
            started_at     TEXT,
            completed_at   TEXT,
            retry_count    INTEGER NOT NULL DEFAULT 0,
            exception      TEXT,               -- only while state = 'failed'
            scheduled_for  TEXT,               -- only while state = 'scheduled'
            recurring_id   TEXT                -- definition that materialized the job
        ) STRICT;

        -- Dispatcher polling: WHERE state IN (...) ORDER BY created_at, id
        CREATE INDEX IF NOT EXISTS idx_jobs_state_due ON jobs (state, scheduled_for);
        CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at, id);

        CREATE TABLE IF NOT EXISTS recurring_jobs (
            id              TEXT NOT NULL PRIMARY KEY,
            cron_expression TEXT NOT NULL,
            job_type        TEXT NOT NULL,
            payload         TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            last_execution  TEXT,
            next_execution  TEXT NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_recurring_next ON recurring_jobs (next_execution);
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 (microseconds, `Z`) so that string order is time order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{raw}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let b = a + Duration::microseconds(1);
        let c = a + Duration::seconds(10);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert!(fmt_ts(b) < fmt_ts(c));
        assert_eq!(parse_ts(&fmt_ts(b)).unwrap(), b);
    }
}
