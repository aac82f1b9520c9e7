use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{types::Type, Connection};

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `job_executions` tables (idempotent) plus the
/// indexes the polling and dependency-gate queries rely on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL UNIQUE,
            task        TEXT    NOT NULL,
            params      TEXT    NOT NULL,   -- JSON object
            schedule    TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            options     TEXT    NOT NULL,   -- JSON-encoded JobOptions
            status      TEXT    NOT NULL DEFAULT 'idle',
            enabled     INTEGER NOT NULL DEFAULT 1, -- 0 while a disable waits for the claim
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL,
            anchor      TEXT    NOT NULL,
            last_run    TEXT,               -- RFC 3339 or NULL
            next_run    TEXT,               -- RFC 3339 or NULL
            due_at      TEXT,               -- grid instant held across a deferral
            last_error  TEXT
        ) STRICT;

        -- Polling: SELECT … WHERE status = 'idle' AND next_run <= ?
        CREATE INDEX IF NOT EXISTS idx_jobs_status_next_run ON jobs (status, next_run);

        CREATE TABLE IF NOT EXISTS job_executions (
            id          TEXT    NOT NULL PRIMARY KEY,
            job_id      TEXT    NOT NULL,
            task        TEXT    NOT NULL,
            firing_id   TEXT    NOT NULL,
            attempt     INTEGER NOT NULL,
            status      TEXT    NOT NULL,
            started_at  TEXT    NOT NULL,
            finished_at TEXT,
            duration_ms INTEGER,            -- derived from started/finished
            result      TEXT,               -- JSON payload on success
            error       TEXT
        ) STRICT;

        -- Dependency gate: latest run of job X with status S since T
        CREATE INDEX IF NOT EXISTS idx_exec_job_started ON job_executions (job_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_exec_status ON job_executions (status);
        CREATE INDEX IF NOT EXISTS idx_exec_started ON job_executions (started_at);
        ",
    )?;
    Ok(())
}

/// Open a file-backed database with WAL journaling and the schema applied.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Current time at the precision the tables store, so a freshly built row
/// compares equal to the one read back.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so lexical order in SQLite equals time order.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts)
}

pub(crate) fn parse_ts(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(col: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(col, &s)).transpose()
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(col: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

pub(crate) fn parse_enum<T: std::str::FromStr<Err = String>>(col: usize, s: &str) -> rusqlite::Result<T> {
    s.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, e.into()))
}
