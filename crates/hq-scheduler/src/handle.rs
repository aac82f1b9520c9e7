use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::{
    db,
    engine::finish_firing,
    error::{Result, SchedulerError},
    executor::{ExecutionOutcome, Executor},
    history::{DailyCount, HistoryStore, Page, Paginated},
    registry::Task,
    schedule,
    store::JobStore,
    types::{ExecutionRecord, Job, JobCreate, JobOptions, JobStatus, JobUpdate, Params, Schedule},
};

/// Jobs and execution counts for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskUsage {
    pub task: String,
    pub jobs: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Inbound operations: task listing, job management, run-now, history and
/// analytics. Shares the stores and executor of the engine that made it.
#[derive(Clone)]
pub struct SchedulerHandle {
    jobs: Arc<dyn JobStore>,
    history: Arc<dyn HistoryStore>,
    executor: Executor,
}

impl SchedulerHandle {
    pub(crate) fn new(jobs: Arc<dyn JobStore>, history: Arc<dyn HistoryStore>, executor: Executor) -> Self {
        Self {
            jobs,
            history,
            executor,
        }
    }

    // --- tasks ---------------------------------------------------------------

    pub fn list_tasks(&self) -> Vec<Task> {
        self.executor.registry().list().cloned().collect()
    }

    pub fn get_task(&self, name: &str) -> Result<Task> {
        self.executor.registry().lookup(name).cloned()
    }

    // --- jobs ----------------------------------------------------------------

    pub async fn create_job(&self, req: JobCreate) -> Result<Job> {
        self.create_job_at(req, db::now()).await
    }

    /// Create a job as of `now`. The first `next_run` is the earliest fire
    /// time at or after `now` (or `start_date` when later).
    pub async fn create_job_at(&self, req: JobCreate, now: DateTime<Utc>) -> Result<Job> {
        let job = self.build_job(Uuid::new_v4().to_string(), req, now)?;
        self.ensure_name_free(&job.name, None).await?;
        self.jobs.create(&job).await?;
        info!(job_id = %job.id, name = %job.name, task = %job.task, schedule = %job.schedule, "job added");
        Ok(job)
    }

    /// Insert or refresh a config-defined job.
    ///
    /// The id is the SHA-256 of `{task, params}`, so the same definition maps to
    /// the same row across restarts.
    pub async fn ensure_default_job(&self, mut req: JobCreate) -> Result<Job> {
        let id = default_job_id(&req.task, &req.params);
        if req.name.is_none() {
            req.name = Some(format!("{}-{}", req.task, &id[..8]));
        }

        match self.jobs.get(&id).await? {
            None => {
                let job = self.build_job(id, req, db::now())?;
                self.ensure_name_free(&job.name, None).await?;
                self.jobs.create(&job).await?;
                info!(job_id = %job.id, name = %job.name, "default job added");
                Ok(job)
            }
            Some(_) => {
                let update = JobUpdate {
                    name: req.name,
                    params: None,
                    schedule: Some(req.schedule),
                    options: Some(req.options),
                };
                self.update_job(&id, update).await
            }
        }
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.jobs.list().await
    }

    /// Apply a partial edit. A changed schedule or start date recomputes
    /// `next_run` from now; status is never touched.
    pub async fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let mut job = self.get_job(id).await?;
        let now = db::now();
        let old_schedule = job.schedule.clone();
        let old_start = job.options.start_date;

        if let Some(name) = update.name {
            if name != job.name {
                self.ensure_name_free(&name, Some(id)).await?;
            }
            job.name = name;
        }
        if let Some(params) = update.params {
            job.params = params;
        }
        if let Some(schedule) = update.schedule {
            job.schedule = schedule;
        }
        if let Some(options) = update.options {
            job.options = options;
        }
        self.validate(&job.name, &job.task, &job.params, &job.schedule, &job.options)?;

        if job.schedule != old_schedule || job.options.start_date != old_start {
            job.anchor = schedule_origin(&job.options, now);
            job.next_run = Some(schedule::first_run(&job.schedule, job.anchor)?);
            job.due_at = None;
        }
        job.updated_at = now;
        self.jobs.update_definition(&job).await?;
        info!(job_id = %id, name = %job.name, "job updated");
        self.get_job(id).await
    }

    pub async fn delete_job(&self, id: &str) -> Result<()> {
        self.jobs.delete(id).await
    }

    /// Stop scheduling `id`.
    ///
    /// A firing already in flight keeps its claim and finishes normally; the
    /// job turns DISABLED when it ends.
    pub async fn disable_job(&self, id: &str) -> Result<Job> {
        if !self.jobs.disable(id, None, db::now()).await? {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job disabled");
        self.get_job(id).await
    }

    /// Resume scheduling `id` with a `next_run` computed from now.
    ///
    /// On a job whose disable is still waiting for its firing to end, this
    /// only withdraws the disable. The claim is never touched, so enabling
    /// cannot start a second firing next to a running one.
    pub async fn enable_job(&self, id: &str) -> Result<Job> {
        let job = self.get_job(id).await?;
        let now = db::now();
        let (next_run, anchor) = if job.status == JobStatus::Disabled {
            if job.options.expired_at(now) {
                return Err(SchedulerError::validation(format!(
                    "job '{}' is past its end date",
                    job.name
                )));
            }
            // re-check the task and schedule that may have disabled it
            self.validate(&job.name, &job.task, &job.params, &job.schedule, &job.options)?;
            let anchor = schedule_origin(&job.options, now);
            (schedule::first_run(&job.schedule, anchor)?, anchor)
        } else {
            (job.next_run.unwrap_or(now), job.anchor)
        };

        if self.jobs.enable(id, next_run, anchor, now).await? {
            info!(job_id = %id, "job enabled");
        }
        self.get_job(id).await
    }

    /// Fire `id` immediately, outside its schedule, and wait for the outcome.
    ///
    /// Takes the same claim as the loop (`JobBusy` if it is already running)
    /// and leaves `next_run` as it was.
    pub async fn run_job_now(&self, id: &str) -> Result<ExecutionOutcome> {
        let job = self.get_job(id).await?;
        if job.status == JobStatus::Disabled {
            return Err(SchedulerError::validation(format!("job '{}' is disabled", job.name)));
        }
        let now = db::now();
        if !self.jobs.claim(id, now).await? {
            return Err(SchedulerError::JobBusy { id: id.to_string() });
        }
        info!(job_id = %id, name = %job.name, "running job now");
        let outcome = self.executor.execute(&job, now).await;
        finish_firing(self.jobs.as_ref(), &job, now, None, &outcome, Duration::from_secs(1)).await;
        Ok(outcome)
    }

    // --- history -------------------------------------------------------------

    pub async fn job_history(&self, id: &str, page: Page) -> Result<Paginated<ExecutionRecord>> {
        self.history.list(Some(id), page).await
    }

    pub async fn list_history(&self, page: Page) -> Result<Paginated<ExecutionRecord>> {
        self.history.list(None, page).await
    }

    // --- analytics -----------------------------------------------------------

    /// Latest `limit` attempts across all jobs.
    pub async fn recent_activity(&self, limit: u32) -> Result<Vec<ExecutionRecord>> {
        Ok(self.history.list(None, Page::first(limit)).await?.items)
    }

    /// Enabled jobs ordered by `next_run`.
    pub async fn upcoming_executions(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .list()
            .await?
            .into_iter()
            .filter(|j| j.status != JobStatus::Disabled && j.next_run.is_some())
            .collect();
        jobs.sort_by_key(|j| j.next_run);
        jobs.truncate(limit);
        Ok(jobs)
    }

    /// Per task: how many jobs use it and how its attempts ended.
    pub async fn task_distribution(&self) -> Result<Vec<TaskUsage>> {
        let mut usage: BTreeMap<String, TaskUsage> = BTreeMap::new();
        let entry = |usage: &mut BTreeMap<String, TaskUsage>, task: &str| {
            usage.entry(task.to_string()).or_insert_with(|| TaskUsage {
                task: task.to_string(),
                jobs: 0,
                completed: 0,
                failed: 0,
            });
        };

        for job in self.jobs.list().await? {
            entry(&mut usage, &job.task);
            if let Some(u) = usage.get_mut(&job.task) {
                u.jobs += 1;
            }
        }
        for counts in self.history.task_counts().await? {
            entry(&mut usage, &counts.task);
            if let Some(u) = usage.get_mut(&counts.task) {
                u.completed = counts.completed;
                u.failed = counts.failed;
            }
        }
        Ok(usage.into_values().collect())
    }

    /// Failed share of finished attempts, `0.0` when nothing has finished.
    pub async fn error_rate(&self) -> Result<f64> {
        let (failed, finished) = self.history.failure_counts().await?;
        if finished == 0 {
            return Ok(0.0);
        }
        Ok(failed as f64 / finished as f64)
    }

    /// Finished-attempt counts for each of the last `days` UTC dates up to
    /// `today`, oldest first, zero-filled.
    pub async fn daily_history(&self, days: u32, today: NaiveDate) -> Result<Vec<DailyCount>> {
        if days == 0 {
            return Ok(Vec::new());
        }
        let first = today - chrono::Duration::days(i64::from(days) - 1);
        let since = Utc.from_utc_datetime(&first.and_time(chrono::NaiveTime::MIN));
        let counted: BTreeMap<NaiveDate, DailyCount> = self
            .history
            .daily_counts(since)
            .await?
            .into_iter()
            .map(|c| (c.date, c))
            .collect();

        Ok(first
            .iter_days()
            .take(days as usize)
            .map(|date| {
                counted.get(&date).cloned().unwrap_or(DailyCount {
                    date,
                    completed: 0,
                    failed: 0,
                    total: 0,
                })
            })
            .collect())
    }

    // --- private helpers -----------------------------------------------------

    fn build_job(&self, id: String, req: JobCreate, now: DateTime<Utc>) -> Result<Job> {
        let name = req.name.unwrap_or_else(|| req.task.clone());
        self.validate(&name, &req.task, &req.params, &req.schedule, &req.options)?;

        let anchor = schedule_origin(&req.options, now);
        let (status, next_run, last_error) = if req.options.expired_at(now) {
            (JobStatus::Disabled, None, Some("end date has passed".to_string()))
        } else {
            let first = schedule::first_run(&req.schedule, anchor)?;
            (JobStatus::Idle, Some(first), None)
        };

        Ok(Job {
            id,
            name,
            task: req.task,
            params: req.params,
            schedule: req.schedule,
            options: req.options,
            status,
            created_at: now,
            updated_at: now,
            last_run: None,
            next_run,
            last_error,
            due_at: None,
            anchor,
        })
    }

    fn validate(
        &self,
        name: &str,
        task: &str,
        params: &Params,
        schedule: &Schedule,
        options: &JobOptions,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(SchedulerError::validation("job name must not be empty"));
        }
        self.executor.registry().lookup(task)?.validate_params(params)?;
        schedule::validate(schedule)?;
        validate_options(name, options)
    }

    async fn ensure_name_free(&self, name: &str, except_id: Option<&str>) -> Result<()> {
        match self.jobs.get_by_name(name).await? {
            Some(existing) if Some(existing.id.as_str()) != except_id => Err(
                SchedulerError::validation(format!("job name '{name}' is already in use")),
            ),
            _ => Ok(()),
        }
    }
}

fn validate_options(name: &str, options: &JobOptions) -> Result<()> {
    if options.timeout == Some(0) {
        return Err(SchedulerError::validation("timeout must be positive"));
    }
    if let (Some(start), Some(end)) = (options.start_date, options.end_date) {
        if start >= end {
            return Err(SchedulerError::validation("start_date must be before end_date"));
        }
    }
    let mut seen = Vec::with_capacity(options.dependencies.len());
    for dep in &options.dependencies {
        if dep.job_name == name {
            return Err(SchedulerError::validation("a job cannot depend on itself"));
        }
        if dep.within_hours == 0 {
            return Err(SchedulerError::validation(format!(
                "dependency on '{}' needs a positive within_hours",
                dep.job_name
            )));
        }
        if !dep.required_status.is_finished() {
            return Err(SchedulerError::validation(format!(
                "dependency on '{}' must require completed or failed",
                dep.job_name
            )));
        }
        if seen.contains(&dep.job_name.as_str()) {
            return Err(SchedulerError::validation(format!(
                "duplicate dependency on '{}'",
                dep.job_name
            )));
        }
        seen.push(dep.job_name.as_str());
    }
    Ok(())
}

fn schedule_origin(options: &JobOptions, now: DateTime<Utc>) -> DateTime<Utc> {
    match options.start_date {
        Some(start) if start > now => start,
        _ => now,
    }
}

/// Hex SHA-256 of the canonical JSON of `{task, params}`.
pub fn default_job_id(task: &str, params: &Params) -> String {
    let canonical = canonical_json(&json!({ "task": task, "params": params }));
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// JSON text with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let fields: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
