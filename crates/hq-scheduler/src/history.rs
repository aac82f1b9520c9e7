use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::{
    db::{init_db, opt_ts, parse_enum, parse_opt_ts, parse_ts, ts},
    error::Result,
    types::{ExecutionRecord, ExecutionStatus},
};

/// Offset/limit window for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Page {
    pub fn first(limit: u32) -> Self {
        Self { offset: 0, limit }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

impl<T> Paginated<T> {
    pub fn has_more(&self) -> bool {
        u64::from(self.offset) + (self.items.len() as u64) < self.total
    }
}

/// Finished-attempt counts for one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Finished-attempt counts for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCount {
    pub task: String,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Append-only log of execution attempts.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: &ExecutionRecord) -> Result<()>;

    /// Advance an appended record (status, finished_at, result, error).
    async fn update(&self, record: &ExecutionRecord) -> Result<()>;

    /// Most recently started attempt of `job_id`.
    async fn latest_for_job(&self, job_id: &str) -> Result<Option<ExecutionRecord>>;

    /// Whether `job_id` has an attempt in one of `statuses` that started at or after `since`.
    async fn find_recent(
        &self,
        job_id: &str,
        statuses: &[ExecutionStatus],
        since: DateTime<Utc>,
    ) -> Result<bool>;

    /// Newest first. `job_id = None` lists every job.
    async fn list(&self, job_id: Option<&str>, page: Page) -> Result<Paginated<ExecutionRecord>>;

    /// Close records left pending/running by a dead process as FAILED.
    async fn fail_in_flight(&self, reason: &str, now: DateTime<Utc>) -> Result<usize>;

    /// Delete records that started before `cutoff`.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Per-day finished counts for attempts started at or after `since`.
    async fn daily_counts(&self, since: DateTime<Utc>) -> Result<Vec<DailyCount>>;

    /// Per-task finished counts.
    async fn task_counts(&self) -> Result<Vec<TaskCount>>;

    /// `(failed, finished)` across the whole log.
    async fn failure_counts(&self) -> Result<(u64, u64)>;
}

const RECORD_COLUMNS: &str =
    "id, job_id, task, firing_id, attempt, status, started_at, finished_at, result, error";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let result: Option<String> = row.get(8)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        task: row.get(2)?,
        firing_id: row.get(3)?,
        attempt: row.get(4)?,
        status: parse_enum(5, &row.get::<_, String>(5)?)?,
        started_at: parse_ts(6, &row.get::<_, String>(6)?)?,
        finished_at: parse_opt_ts(7, row.get(7)?)?,
        result: result
            .map(|s| crate::db::parse_json(8, &s))
            .transpose()?,
        error: row.get(9)?,
    })
}

fn duration_ms(record: &ExecutionRecord) -> Option<i64> {
    record.duration().map(|d| d.num_milliseconds())
}

/// SQLite-backed [`HistoryStore`].
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("history store mutex poisoned")
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO job_executions
             (id, job_id, task, firing_id, attempt, status, started_at,
              finished_at, duration_ms, result, error)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                record.id,
                record.job_id,
                record.task,
                record.firing_id,
                record.attempt,
                record.status.to_string(),
                ts(record.started_at),
                opt_ts(record.finished_at),
                duration_ms(record),
                record.result.as_ref().map(serde_json::to_string).transpose()?,
                record.error,
            ],
        )?;
        Ok(())
    }

    async fn update(&self, record: &ExecutionRecord) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE job_executions
             SET status=?2, started_at=?3, finished_at=?4, duration_ms=?5, result=?6, error=?7
             WHERE id=?1",
            params![
                record.id,
                record.status.to_string(),
                ts(record.started_at),
                opt_ts(record.finished_at),
                duration_ms(record),
                record.result.as_ref().map(serde_json::to_string).transpose()?,
                record.error,
            ],
        )?;
        Ok(())
    }

    async fn latest_for_job(&self, job_id: &str) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM job_executions
                     WHERE job_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT 1"
                ),
                [job_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    async fn find_recent(
        &self,
        job_id: &str,
        statuses: &[ExecutionStatus],
        since: DateTime<Utc>,
    ) -> Result<bool> {
        if statuses.is_empty() {
            return Ok(false);
        }
        let placeholders = (0..statuses.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM job_executions
             WHERE job_id = ?1 AND started_at >= ?2 AND status IN ({placeholders}))"
        );
        let mut args = vec![job_id.to_string(), ts(since)];
        args.extend(statuses.iter().map(|s| s.to_string()));

        let conn = self.conn();
        let found: bool = conn.query_row(&sql, params_from_iter(args), |r| r.get(0))?;
        Ok(found)
    }

    async fn list(&self, job_id: Option<&str>, page: Page) -> Result<Paginated<ExecutionRecord>> {
        let conn = self.conn();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM job_executions WHERE ?1 IS NULL OR job_id = ?1",
            [job_id],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RECORD_COLUMNS} FROM job_executions
             WHERE ?1 IS NULL OR job_id = ?1
             ORDER BY started_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let items = stmt
            .query_map(params![job_id, page.limit, page.offset], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Paginated {
            items,
            total: total.max(0) as u64,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn fail_in_flight(&self, reason: &str, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE job_executions SET status = 'failed', finished_at = ?1, error = ?2
             WHERE status IN ('pending', 'running')",
            params![ts(now), reason],
        )?;
        Ok(n)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "DELETE FROM job_executions WHERE started_at < ?1",
            [ts(cutoff)],
        )?;
        Ok(n)
    }

    async fn daily_counts(&self, since: DateTime<Utc>) -> Result<Vec<DailyCount>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT substr(started_at, 1, 10) AS day,
                    SUM(status = 'completed'), SUM(status = 'failed'), COUNT(*)
             FROM job_executions
             WHERE started_at >= ?1 AND status IN ('completed', 'failed')
             GROUP BY day ORDER BY day",
        )?;
        let rows = stmt
            .query_map([ts(since)], |row| {
                let day: String = row.get(0)?;
                let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d").map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                })?;
                Ok(DailyCount {
                    date,
                    completed: row.get::<_, i64>(1)?.max(0) as u64,
                    failed: row.get::<_, i64>(2)?.max(0) as u64,
                    total: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn task_counts(&self) -> Result<Vec<TaskCount>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT task, SUM(status = 'completed'), SUM(status = 'failed'), COUNT(*)
             FROM job_executions
             WHERE status IN ('completed', 'failed')
             GROUP BY task ORDER BY task",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TaskCount {
                    task: row.get(0)?,
                    completed: row.get::<_, i64>(1)?.max(0) as u64,
                    failed: row.get::<_, i64>(2)?.max(0) as u64,
                    total: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn failure_counts(&self) -> Result<(u64, u64)> {
        let conn = self.conn();
        let (failed, finished): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(status = 'failed'), 0), COUNT(*)
             FROM job_executions WHERE status IN ('completed', 'failed')",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok((failed.max(0) as u64, finished.max(0) as u64))
    }
}
