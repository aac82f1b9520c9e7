use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{error, info};

use crate::{
    db::{init_db, opt_ts, parse_enum, parse_json, parse_opt_ts, parse_ts, ts},
    error::{Result, SchedulerError},
    types::{Job, JobStatus},
};

/// Durable CRUD for job definitions and their scheduling state.
///
/// Every method is a single-record atomic operation. `claim` and `release`
/// bracket a firing; nothing else may move a job out of RUNNING.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Job>>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Job>>;

    /// All jobs ordered by creation time.
    async fn list(&self) -> Result<Vec<Job>>;

    /// Enabled jobs with `status = idle` and `next_run <= now`, earliest first.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Whole-row replace of the mutable fields; the enabled flag follows
    /// `status`. `JobNotFound` if the row is gone.
    async fn update(&self, job: &Job) -> Result<()>;

    /// Replace the definition (name, params, schedule, options, anchor,
    /// next_run) without touching status or last_run, so an edit can never
    /// undo a claim.
    async fn update_definition(&self, job: &Job) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Defer an enabled IDLE job to `next_run`, remembering the instant it was
    /// originally due. `Ok(false)` if it is no longer IDLE.
    async fn reschedule(&self, id: &str, next_run: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool>;

    /// Atomically move `id` from IDLE to RUNNING. `Ok(false)` means someone
    /// else holds the job (or it is disabled/gone).
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// End the firing claimed on a row whose `next_run` was `claimed_next_run`.
    ///
    /// Records `last_run`, and goes back to IDLE, or to DISABLED when a
    /// disable arrived meanwhile or `fatal_error` is set. `next_run` moves only
    /// if no edit replaced it during the firing. `Ok(false)` if the row is gone
    /// or not RUNNING.
    async fn release(
        &self,
        id: &str,
        fired_at: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        claimed_next_run: Option<DateTime<Utc>>,
        fatal_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Stop scheduling `id`. An IDLE job becomes DISABLED at once; a RUNNING
    /// one keeps its claim and becomes DISABLED on `release`. `reason` replaces
    /// `last_error` when given. `Ok(false)` if the row is gone.
    async fn disable(&self, id: &str, reason: Option<&str>, now: DateTime<Utc>) -> Result<bool>;

    /// Undo a disable. A DISABLED job returns to IDLE at `next_run` with its
    /// error cleared and a new `anchor`; a RUNNING job only drops its pending
    /// disable. `Ok(false)` if there was nothing to enable.
    async fn enable(
        &self,
        id: &str,
        next_run: DateTime<Utc>,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Return jobs left RUNNING by a previous process to IDLE, or to DISABLED
    /// when a disable was pending.
    async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<usize>;
}

const JOB_COLUMNS: &str = "id, name, task, params, schedule, options, status,
     created_at, updated_at, last_run, next_run, last_error, due_at, anchor";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        task: row.get(2)?,
        params: parse_json(3, &row.get::<_, String>(3)?)?,
        schedule: parse_json(4, &row.get::<_, String>(4)?)?,
        options: parse_json(5, &row.get::<_, String>(5)?)?,
        status: parse_enum(6, &row.get::<_, String>(6)?)?,
        created_at: parse_ts(7, &row.get::<_, String>(7)?)?,
        updated_at: parse_ts(8, &row.get::<_, String>(8)?)?,
        last_run: parse_opt_ts(9, row.get(9)?)?,
        next_run: parse_opt_ts(10, row.get(10)?)?,
        last_error: row.get(11)?,
        due_at: parse_opt_ts(12, row.get(12)?)?,
        anchor: parse_ts(13, &row.get::<_, String>(13)?)?,
    })
}

/// SQLite-backed [`JobStore`].
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store (tests, throwaway runs).
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("job store mutex poisoned")
    }

    fn query_jobs(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(args, job_from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            match row {
                Ok(job) => jobs.push(job),
                // An undecodable row must not hide every other job.
                Err(e) => error!("skipping unreadable job row: {e}"),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO jobs
             (id, name, task, params, schedule, options, status, enabled,
              created_at, updated_at, last_run, next_run, last_error, due_at, anchor)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                job.id,
                job.name,
                job.task,
                serde_json::to_string(&job.params)?,
                serde_json::to_string(&job.schedule)?,
                serde_json::to_string(&job.options)?,
                job.status.to_string(),
                job.status != JobStatus::Disabled,
                ts(job.created_at),
                ts(job.updated_at),
                opt_ts(job.last_run),
                opt_ts(job.next_run),
                job.last_error,
                opt_ts(job.due_at),
                ts(job.anchor),
            ],
        )?;
        info!(job_id = %job.id, name = %job.name, task = %job.task, "job stored");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
                [name],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    async fn list(&self) -> Result<Vec<Job>> {
        self.query_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at, id"),
            [],
        )
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE status = 'idle' AND enabled = 1
                   AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run"
            ),
            [ts(now)],
        )
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET name=?2, task=?3, params=?4, schedule=?5, options=?6,
                 status=?7, enabled=?8, updated_at=?9, last_run=?10, next_run=?11,
                 last_error=?12, due_at=?13, anchor=?14
             WHERE id=?1",
            params![
                job.id,
                job.name,
                job.task,
                serde_json::to_string(&job.params)?,
                serde_json::to_string(&job.schedule)?,
                serde_json::to_string(&job.options)?,
                job.status.to_string(),
                job.status != JobStatus::Disabled,
                ts(job.updated_at),
                opt_ts(job.last_run),
                opt_ts(job.next_run),
                job.last_error,
                opt_ts(job.due_at),
                ts(job.anchor),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: job.id.clone() });
        }
        Ok(())
    }

    async fn update_definition(&self, job: &Job) -> Result<()> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET name=?2, params=?3, schedule=?4, options=?5,
                 next_run=?6, due_at=?7, anchor=?8, updated_at=?9
             WHERE id=?1",
            params![
                job.id,
                job.name,
                serde_json::to_string(&job.params)?,
                serde_json::to_string(&job.schedule)?,
                serde_json::to_string(&job.options)?,
                opt_ts(job.next_run),
                opt_ts(job.due_at),
                ts(job.anchor),
                ts(job.updated_at),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: job.id.clone() });
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    async fn reschedule(&self, id: &str, next_run: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET due_at = COALESCE(due_at, next_run), next_run = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'idle' AND enabled = 1",
            params![id, ts(next_run), ts(now)],
        )?;
        Ok(n == 1)
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET status = 'running', updated_at = ?2
             WHERE id = ?1 AND status = 'idle' AND enabled = 1",
            params![id, ts(now)],
        )?;
        Ok(n == 1)
    }

    async fn release(
        &self,
        id: &str,
        fired_at: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        claimed_next_run: Option<DateTime<Utc>>,
        fatal_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn();
        // SET expressions all see the row as it was before this statement.
        let n = conn.execute(
            "UPDATE jobs SET
                 status     = CASE WHEN ?5 IS NULL AND enabled = 1 THEN 'idle' ELSE 'disabled' END,
                 enabled    = CASE WHEN ?5 IS NULL THEN enabled ELSE 0 END,
                 last_error = COALESCE(?5, last_error),
                 last_run   = ?2,
                 next_run   = CASE WHEN ?3 IS NOT NULL AND next_run IS ?4 THEN ?3 ELSE next_run END,
                 due_at     = CASE WHEN ?3 IS NOT NULL AND next_run IS ?4 THEN NULL ELSE due_at END,
                 updated_at = ?6
             WHERE id = ?1 AND status = 'running'",
            params![id, ts(fired_at), opt_ts(next_run), opt_ts(claimed_next_run), fatal_error, ts(now)],
        )?;
        Ok(n == 1)
    }

    async fn disable(&self, id: &str, reason: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET
                 enabled    = 0,
                 status     = CASE status WHEN 'running' THEN 'running' ELSE 'disabled' END,
                 last_error = COALESCE(?2, last_error),
                 updated_at = ?3
             WHERE id = ?1",
            params![id, reason, ts(now)],
        )?;
        Ok(n == 1)
    }

    async fn enable(
        &self,
        id: &str,
        next_run: DateTime<Utc>,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET
                 enabled    = 1,
                 status     = CASE status WHEN 'disabled' THEN 'idle' ELSE status END,
                 next_run   = CASE status WHEN 'disabled' THEN ?2 ELSE next_run END,
                 anchor     = CASE status WHEN 'disabled' THEN ?3 ELSE anchor END,
                 due_at     = CASE status WHEN 'disabled' THEN NULL ELSE due_at END,
                 last_error = CASE status WHEN 'disabled' THEN NULL ELSE last_error END,
                 updated_at = ?4
             WHERE id = ?1 AND (status = 'disabled' OR enabled = 0)",
            params![id, ts(next_run), ts(anchor), ts(now)],
        )?;
        Ok(n == 1)
    }

    async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET status = CASE enabled WHEN 1 THEN 'idle' ELSE 'disabled' END,
                 updated_at = ?1
             WHERE status = 'running'",
            params![ts(now)],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobOptions, Schedule, TimeUnit};
    use chrono::{Duration, TimeZone};

    fn job(id: &str, name: &str, next_run: DateTime<Utc>) -> Job {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        Job {
            id: id.into(),
            name: name.into(),
            task: "noop".into(),
            params: Default::default(),
            schedule: Schedule::every(1, TimeUnit::Hours),
            options: JobOptions::default(),
            status: JobStatus::Idle,
            created_at: created,
            updated_at: created,
            last_run: None,
            next_run: Some(next_run),
            last_error: None,
            due_at: None,
            anchor: created,
        }
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
        let j = job("a", "alpha", t);
        store.create(&j).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(j.clone()));
        assert_eq!(store.get_by_name("alpha").await.unwrap(), Some(j));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn names_are_unique() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
        store.create(&job("a", "same", t)).await.unwrap();
        let err = store.create(&job("b", "same", t)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Storage(_)));
    }

    #[tokio::test]
    async fn list_due_only_returns_idle_jobs_at_or_before_now() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        store.create(&job("past", "past", now - Duration::minutes(5))).await.unwrap();
        store.create(&job("exact", "exact", now)).await.unwrap();
        store.create(&job("future", "future", now + Duration::seconds(1))).await.unwrap();
        let mut disabled = job("off", "off", now - Duration::hours(1));
        disabled.status = JobStatus::Disabled;
        store.create(&disabled).await.unwrap();

        let due: Vec<_> = store.list_due(now).await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(due, ["past", "exact"]);
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_hides_job_from_list_due() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        store.create(&job("a", "a", now)).await.unwrap();

        assert!(store.claim("a", now).await.unwrap());
        assert!(!store.claim("a", now).await.unwrap(), "second claim must lose");
        assert!(store.list_due(now).await.unwrap().is_empty());
        assert_eq!(store.get("a").await.unwrap().unwrap().status, JobStatus::Running);

        assert_eq!(store.release_stale_claims(now).await.unwrap(), 1);
        assert_eq!(store.get("a").await.unwrap().unwrap().status, JobStatus::Idle);
    }

    #[tokio::test]
    async fn definition_update_preserves_claim() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut j = job("a", "a", now);
        store.create(&j).await.unwrap();
        store.claim("a", now).await.unwrap();

        j.schedule = Schedule::every(5, TimeUnit::Minutes);
        j.status = JobStatus::Idle; // stale view of the row
        store.update_definition(&j).await.unwrap();

        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.schedule, Schedule::every(5, TimeUnit::Minutes));
    }

    #[tokio::test]
    async fn reschedule_only_moves_idle_jobs() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        store.create(&job("a", "a", now)).await.unwrap();

        let later = now + Duration::seconds(30);
        assert!(store.reschedule("a", later, now).await.unwrap());
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.next_run, Some(later));
        assert_eq!(stored.due_at, Some(now));

        // a second deferral keeps the original due instant
        let again = later + Duration::seconds(30);
        assert!(store.reschedule("a", again, later).await.unwrap());
        assert_eq!(store.get("a").await.unwrap().unwrap().due_at, Some(now));

        store.claim("a", again).await.unwrap();
        assert!(!store.reschedule("a", again + Duration::hours(1), again).await.unwrap());

        let next = now + Duration::hours(1);
        assert!(store.release("a", now, Some(next), Some(again), None, again).await.unwrap());
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.next_run, Some(next));
        assert_eq!(stored.due_at, None);
    }

    #[tokio::test]
    async fn release_returns_the_job_to_idle_with_its_next_run() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        store.create(&job("a", "a", now)).await.unwrap();
        assert!(!store.release("a", now, None, Some(now), None, now).await.unwrap(), "not claimed");

        store.claim("a", now).await.unwrap();
        let next = now + Duration::hours(1);
        assert!(store.release("a", now, Some(next), Some(now), None, now).await.unwrap());
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Idle);
        assert_eq!(stored.last_run, Some(now));
        assert_eq!(stored.next_run, Some(next));
    }

    #[tokio::test]
    async fn release_keeps_a_next_run_edited_during_the_firing() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut j = job("a", "a", now);
        store.create(&j).await.unwrap();
        store.claim("a", now).await.unwrap();

        let edited = now + Duration::minutes(5);
        j.schedule = Schedule::every(5, TimeUnit::Minutes);
        j.next_run = Some(edited);
        store.update_definition(&j).await.unwrap();

        store
            .release("a", now, Some(now + Duration::hours(1)), Some(now), None, now)
            .await
            .unwrap();
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.next_run, Some(edited));
        assert_eq!(stored.schedule, Schedule::every(5, TimeUnit::Minutes));
        assert_eq!(stored.status, JobStatus::Idle);
    }

    #[tokio::test]
    async fn fatal_release_disables_with_the_error() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        store.create(&job("a", "a", now)).await.unwrap();
        store.claim("a", now).await.unwrap();

        store
            .release("a", now, Some(now + Duration::hours(1)), Some(now), Some("unknown task"), now)
            .await
            .unwrap();
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Disabled);
        assert_eq!(stored.last_error.as_deref(), Some("unknown task"));
        assert!(!store.claim("a", now).await.unwrap());
    }

    #[tokio::test]
    async fn disable_never_breaks_a_claim() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        store.create(&job("a", "a", now)).await.unwrap();
        store.claim("a", now).await.unwrap();

        assert!(store.disable("a", None, now).await.unwrap());
        assert_eq!(store.get("a").await.unwrap().unwrap().status, JobStatus::Running);

        // withdrawing the disable keeps the claim; nobody else can take the job
        assert!(store.enable("a", now, now, now).await.unwrap());
        assert_eq!(store.get("a").await.unwrap().unwrap().status, JobStatus::Running);
        assert!(!store.claim("a", now).await.unwrap());

        store.disable("a", None, now).await.unwrap();
        store.release("a", now, None, Some(now), None, now).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().status, JobStatus::Disabled);
        assert!(store.list_due(now).await.unwrap().is_empty());

        let next = now + Duration::hours(1);
        assert!(store.enable("a", next, now, now).await.unwrap());
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Idle);
        assert_eq!(stored.next_run, Some(next));
        assert!(!store.enable("a", next, now, now).await.unwrap(), "already enabled");
    }

    #[tokio::test]
    async fn stale_claim_with_pending_disable_ends_disabled() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        store.create(&job("a", "a", now)).await.unwrap();
        store.claim("a", now).await.unwrap();
        store.disable("a", None, now).await.unwrap();

        assert_eq!(store.release_stale_claims(now).await.unwrap(), 1);
        assert_eq!(store.get("a").await.unwrap().unwrap().status, JobStatus::Disabled);
    }

    #[tokio::test]
    async fn update_and_delete_missing_job_fail() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let j = job("ghost", "ghost", now);
        assert!(matches!(store.update(&j).await, Err(SchedulerError::JobNotFound { .. })));
        assert!(matches!(store.delete("ghost").await, Err(SchedulerError::JobNotFound { .. })));
    }
}
