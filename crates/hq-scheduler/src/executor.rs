use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    db,
    error::SchedulerError,
    history::HistoryStore,
    registry::{TaskContext, TaskHandler, TaskRegistry},
    types::{ExecutionRecord, ExecutionStatus, Job},
};

/// Exponential retry delay: `base · 2^attempt` plus jitter in `[0, base)`,
/// never longer than `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the zero-based `attempt` failed.
    ///
    /// Jitter is derived from `key` (the firing id), so concurrent firings
    /// spread out while one firing's delays stay reproducible.
    pub fn delay(&self, attempt: u32, key: &str) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let mut ms = base_ms.saturating_mul(factor);
        if self.jitter && base_ms > 0 {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            attempt.hash(&mut hasher);
            ms = ms.saturating_add(hasher.finish() % base_ms);
        }
        Duration::from_millis(ms).min(self.cap)
    }
}

/// Result of one firing (all attempts).
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub firing_id: String,
    /// Status of the last attempt.
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub result: Option<Value>,
    /// Error of the last attempt, if it failed.
    pub error: Option<SchedulerError>,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// The job can never run as configured; the engine disables it.
    pub fn is_fatal(&self) -> bool {
        matches!(self.error, Some(SchedulerError::UnknownTask { .. }))
    }
}

/// Runs one firing of a job: timeout per attempt, retries with backoff, one
/// history record per attempt.
///
/// History write failures are logged and never change the outcome.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<TaskRegistry>,
    history: Arc<dyn HistoryStore>,
    backoff: BackoffPolicy,
    cancel_grace: Duration,
}

impl Executor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        history: Arc<dyn HistoryStore>,
        backoff: BackoffPolicy,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            registry,
            history,
            backoff,
            cancel_grace,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Execute `job` for the firing scheduled at `fired_at`.
    pub async fn execute(&self, job: &Job, fired_at: DateTime<Utc>) -> ExecutionOutcome {
        let firing_id = Uuid::new_v4().to_string();

        let handler = match self.registry.lookup(&job.task) {
            Ok(task) => task.handler(),
            Err(e) => {
                error!(job_id = %job.id, task = %job.task, "job references an unknown task");
                let now = db::now();
                let record = ExecutionRecord {
                    id: Uuid::new_v4().to_string(),
                    job_id: job.id.clone(),
                    task: job.task.clone(),
                    firing_id: firing_id.clone(),
                    attempt: 0,
                    status: ExecutionStatus::Failed,
                    started_at: now,
                    finished_at: Some(now),
                    result: None,
                    error: Some(e.to_string()),
                };
                self.append(&record).await;
                return ExecutionOutcome {
                    firing_id,
                    status: ExecutionStatus::Failed,
                    attempts: 1,
                    result: None,
                    error: Some(e),
                };
            }
        };

        let total = job.options.total_attempts();
        debug!(job_id = %job.id, %firing_id, %fired_at, attempts = total, "firing");

        let mut attempt = 0;
        loop {
            let mut record = ExecutionRecord {
                id: Uuid::new_v4().to_string(),
                job_id: job.id.clone(),
                task: job.task.clone(),
                firing_id: firing_id.clone(),
                attempt,
                status: ExecutionStatus::Pending,
                started_at: db::now(),
                finished_at: None,
                result: None,
                error: None,
            };
            self.append(&record).await;

            record.status = ExecutionStatus::Running;
            record.started_at = db::now();
            self.update(&record).await;

            let ctx = TaskContext {
                job_id: job.id.clone(),
                params: job.params.clone(),
                attempt,
                cancel: CancellationToken::new(),
            };
            let outcome = self.run_attempt(Arc::clone(&handler), ctx, job.options.timeout).await;
            record.finished_at = Some(db::now());

            match outcome {
                Ok(value) => {
                    record.status = ExecutionStatus::Completed;
                    record.result = Some(value.clone());
                    self.update(&record).await;
                    info!(job_id = %job.id, %firing_id, attempt, "attempt completed");
                    return ExecutionOutcome {
                        firing_id,
                        status: ExecutionStatus::Completed,
                        attempts: attempt + 1,
                        result: Some(value),
                        error: None,
                    };
                }
                Err(e) => {
                    record.status = ExecutionStatus::Failed;
                    record.error = Some(e.to_string());
                    self.update(&record).await;

                    if attempt + 1 >= total {
                        warn!(job_id = %job.id, %firing_id, attempt, error = %e, "firing failed");
                        return ExecutionOutcome {
                            firing_id,
                            status: ExecutionStatus::Failed,
                            attempts: attempt + 1,
                            result: None,
                            error: Some(e),
                        };
                    }

                    let delay = self.backoff.delay(attempt, &firing_id);
                    warn!(
                        job_id = %job.id, %firing_id, attempt, error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        handler: Arc<dyn TaskHandler>,
        ctx: TaskContext,
        timeout: Option<u64>,
    ) -> std::result::Result<Value, SchedulerError> {
        let cancel = ctx.cancel.clone();
        let mut task = tokio::spawn(async move { handler.run(ctx).await });

        let joined = match timeout {
            None => (&mut task).await,
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.cancel();
                    if tokio::time::timeout(self.cancel_grace, &mut task).await.is_err() {
                        warn!("task ignored cancellation, aborting");
                        task.abort();
                    }
                    return Err(SchedulerError::Timeout { secs });
                }
            },
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SchedulerError::TaskExecution(format!("{e:#}"))),
            Err(e) if e.is_panic() => Err(SchedulerError::TaskExecution("task panicked".into())),
            Err(_) => Err(SchedulerError::TaskExecution("task was cancelled".into())),
        }
    }

    async fn append(&self, record: &ExecutionRecord) {
        if let Err(e) = self.history.append(record).await {
            error!(record_id = %record.id, job_id = %record.job_id, "history append failed: {e}");
        }
    }

    async fn update(&self, record: &ExecutionRecord) {
        if let Err(e) = self.history.update(record).await {
            error!(record_id = %record.id, job_id = %record.job_id, "history update failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use chrono::TimeZone;

    use crate::{
        history::{Page, SqliteHistoryStore},
        types::{JobOptions, JobStatus, Schedule, TimeUnit},
    };

    fn job(task: &str, options: JobOptions) -> Job {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        Job {
            id: "job-1".into(),
            name: "job".into(),
            task: task.into(),
            params: Default::default(),
            schedule: Schedule::every(1, TimeUnit::Hours),
            options,
            status: JobStatus::Running,
            created_at: t,
            updated_at: t,
            last_run: None,
            next_run: Some(t),
            last_error: None,
            due_at: None,
            anchor: t,
        }
    }

    fn executor(registry: TaskRegistry, history: Arc<SqliteHistoryStore>) -> Executor {
        Executor::new(
            Arc::new(registry),
            history,
            BackoffPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_secs(1),
                jitter: false,
            },
            Duration::from_millis(100),
        )
    }

    async fn ok_task(_ctx: TaskContext) -> anyhow::Result<Value> {
        Ok(Value::from("done"))
    }

    async fn slow_task(ctx: TaskContext) -> anyhow::Result<Value> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(Value::Null),
            _ = ctx.cancel.cancelled() => anyhow::bail!("cancelled"),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = BackoffPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter: false,
        };
        assert_eq!(p.delay(0, "f"), Duration::from_secs(1));
        assert_eq!(p.delay(3, "f"), Duration::from_secs(8));
        assert_eq!(p.delay(20, "f"), Duration::from_secs(300));
        assert_eq!(p.delay(200, "f"), Duration::from_secs(300));
    }

    #[test]
    fn backoff_jitter_is_bounded_and_stable() {
        let p = BackoffPolicy::default();
        let d = p.delay(2, "firing");
        assert!(d >= Duration::from_secs(4) && d < Duration::from_secs(5));
        assert_eq!(d, p.delay(2, "firing"));
    }

    #[tokio::test]
    async fn success_writes_one_completed_record() {
        let mut reg = TaskRegistry::new();
        reg.register("ok", "Ok", None, ok_task).unwrap();
        let history = Arc::new(SqliteHistoryStore::open_in_memory().unwrap());
        let exec = executor(reg, history.clone());

        let j = job("ok", JobOptions::default());
        let out = exec.execute(&j, j.next_run.unwrap()).await;
        assert!(out.succeeded());
        assert_eq!(out.attempts, 1);
        assert_eq!(out.result, Some(Value::from("done")));

        let page = history.list(Some("job-1"), Page::first(10)).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].status, ExecutionStatus::Completed);
        assert_eq!(page.items[0].result, Some(Value::from("done")));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_share_a_firing_id() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut reg = TaskRegistry::new();
        reg.register("flaky", "Flaky", None, move |_ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("not yet");
                }
                Ok::<_, anyhow::Error>(Value::Null)
            }
        })
        .unwrap();
        let history = Arc::new(SqliteHistoryStore::open_in_memory().unwrap());
        let exec = executor(reg, history.clone());

        let j = job("flaky", JobOptions { max_retries: 3, ..Default::default() });
        let out = exec.execute(&j, j.next_run.unwrap()).await;
        assert!(out.succeeded());
        assert_eq!(out.attempts, 3);

        let page = history.list(Some("job-1"), Page::first(10)).await.unwrap();
        assert_eq!(page.total, 3);
        assert!(page.items.iter().all(|r| r.firing_id == out.firing_id));
        let failed = page.items.iter().filter(|r| r.status == ExecutionStatus::Failed).count();
        assert_eq!(failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_the_attempt() {
        let mut reg = TaskRegistry::new();
        reg.register("slow", "Slow", None, slow_task).unwrap();
        let history = Arc::new(SqliteHistoryStore::open_in_memory().unwrap());
        let exec = executor(reg, history.clone());

        let started = tokio::time::Instant::now();
        let j = job("slow", JobOptions { timeout: Some(1), ..Default::default() });
        let out = exec.execute(&j, j.next_run.unwrap()).await;
        assert!(!out.succeeded());
        assert!(matches!(out.error, Some(SchedulerError::Timeout { secs: 1 })));
        assert!(started.elapsed() < Duration::from_secs(2));

        let latest = history.latest_for_job("job-1").await.unwrap().unwrap();
        assert_eq!(latest.status, ExecutionStatus::Failed);
        assert!(latest.error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn task_ignoring_cancellation_is_aborted_after_the_grace() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let mut reg = TaskRegistry::new();
        reg.register("stubborn", "Stubborn", None, move |_ctx: TaskContext| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(Value::Null)
            }
        })
        .unwrap();
        let history = Arc::new(SqliteHistoryStore::open_in_memory().unwrap());
        let exec = executor(reg, history.clone());

        let started = tokio::time::Instant::now();
        let j = job("stubborn", JobOptions { timeout: Some(1), ..Default::default() });
        let out = exec.execute(&j, j.next_run.unwrap()).await;
        let elapsed = started.elapsed();
        assert!(matches!(out.error, Some(SchedulerError::Timeout { secs: 1 })));
        // one second of timeout plus the 100ms cancel grace
        assert!(elapsed >= Duration::from_millis(1100), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1110), "{elapsed:?}");

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst), "aborted task kept running");
        let latest = history.latest_for_job("job-1").await.unwrap().unwrap();
        assert_eq!(latest.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_task_fails_once_without_retry() {
        let history = Arc::new(SqliteHistoryStore::open_in_memory().unwrap());
        let exec = executor(TaskRegistry::new(), history.clone());

        let j = job("ghost", JobOptions { max_retries: 5, ..Default::default() });
        let out = exec.execute(&j, j.next_run.unwrap()).await;
        assert!(out.is_fatal());
        assert_eq!(out.attempts, 1);
        assert_eq!(history.list(None, Page::first(10)).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn panicking_task_is_a_failed_attempt() {
        let mut reg = TaskRegistry::new();
        reg.register("boom", "Boom", None, |_ctx: TaskContext| async move {
            if true {
                panic!("boom");
            }
            Ok::<_, anyhow::Error>(Value::Null)
        })
        .unwrap();
        let history = Arc::new(SqliteHistoryStore::open_in_memory().unwrap());
        let exec = executor(reg, history);

        let j = job("boom", JobOptions::default());
        let out = exec.execute(&j, j.next_run.unwrap()).await;
        assert!(matches!(out.error, Some(SchedulerError::TaskExecution(ref m)) if m.contains("panicked")));
        assert!(!out.is_fatal());
    }
}
