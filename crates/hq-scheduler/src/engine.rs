use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use hq_core::config::SchedulerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    db,
    error::{Result, SchedulerError},
    executor::{BackoffPolicy, ExecutionOutcome, Executor},
    handle::SchedulerHandle,
    history::HistoryStore,
    registry::TaskRegistry,
    schedule,
    store::JobStore,
    types::{ExecutionStatus, Job},
};

/// Error written to history records a dead process left in flight.
pub const INTERRUPTED: &str = "interrupted by process restart";

const PURGE_EVERY: Duration = Duration::from_secs(3600);
const FINISH_ATTEMPTS: u32 = 5;

/// Engine tunables, usually built from `[scheduler]` in hq.toml.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick: Duration,
    /// How far a dependency-gated job is pushed back.
    pub gate_grace: chrono::Duration,
    pub backoff: BackoffPolicy,
    pub cancel_grace: Duration,
    /// `None` keeps history forever.
    pub history_retention: Option<chrono::Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for EngineConfig {
    fn from(c: &SchedulerConfig) -> Self {
        Self {
            tick: Duration::from_millis(c.tick_ms.max(1)),
            gate_grace: chrono::Duration::seconds(c.gate_grace_secs.min(i32::MAX as u64) as i64),
            backoff: BackoffPolicy {
                base: Duration::from_millis(c.backoff_base_ms),
                cap: Duration::from_secs(c.backoff_cap_secs),
                jitter: c.backoff_jitter,
            },
            cancel_grace: Duration::from_millis(c.cancel_grace_ms),
            history_retention: (c.history_retention_days > 0)
                .then(|| chrono::Duration::days(i64::from(c.history_retention_days))),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Claimed firings, by job id. Dropping a handle does not stop the firing.
    pub dispatched: Vec<(String, JoinHandle<ExecutionOutcome>)>,
    /// Held back by the dependency gate.
    pub deferred: Vec<String>,
    /// Lost the claim (already running, disabled or deleted meanwhile).
    pub skipped: Vec<String>,
    /// Disabled by this tick (expired or unschedulable).
    pub disabled: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty()
            && self.deferred.is_empty()
            && self.skipped.is_empty()
            && self.disabled.is_empty()
    }

    /// Wait for every dispatched firing to finish.
    pub async fn join(self) -> Vec<ExecutionOutcome> {
        let handles = self.dispatched.into_iter().map(|(_, h)| h);
        join_all(handles)
            .await
            .into_iter()
            .filter_map(|r| match r {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!("firing task failed to join: {e}");
                    None
                }
            })
            .collect()
    }
}

/// The scheduler loop: finds due jobs, gates, claims and dispatches them,
/// then books each outcome back onto the job.
///
/// Cheap to clone; every dispatched firing runs on its own clone.
#[derive(Clone)]
pub struct SchedulerEngine {
    jobs: Arc<dyn JobStore>,
    history: Arc<dyn HistoryStore>,
    executor: Executor,
    config: EngineConfig,
}

impl SchedulerEngine {
    pub fn new(
        registry: Arc<TaskRegistry>,
        jobs: Arc<dyn JobStore>,
        history: Arc<dyn HistoryStore>,
        config: EngineConfig,
    ) -> Self {
        let executor = Executor::new(
            registry,
            Arc::clone(&history),
            config.backoff,
            config.cancel_grace,
        );
        Self {
            jobs,
            history,
            executor,
            config,
        }
    }

    /// Inbound handle sharing this engine's stores and executor.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(
            Arc::clone(&self.jobs),
            Arc::clone(&self.history),
            self.executor.clone(),
        )
    }

    /// Main event loop. Ticks every `config.tick` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.config.tick.as_millis() as u64, "scheduler engine started");
        if let Err(e) = self.reconcile_on_startup(db::now()).await {
            error!("startup reconciliation failed: {e}");
        }

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purger = tokio::time::interval(PURGE_EVERY);
        purger.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Vec<JoinHandle<ExecutionOutcome>> = Vec::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    in_flight.retain(|h| !h.is_finished());
                    match self.tick(db::now()).await {
                        Ok(report) => {
                            if !report.is_empty() {
                                debug!(
                                    dispatched = report.dispatched.len(),
                                    deferred = report.deferred.len(),
                                    skipped = report.skipped.len(),
                                    disabled = report.disabled.len(),
                                    "tick"
                                );
                            }
                            in_flight.extend(report.dispatched.into_iter().map(|(_, h)| h));
                        }
                        Err(e) => error!("scheduler tick error: {e}"),
                    }
                }
                _ = purger.tick(), if self.config.history_retention.is_some() => {
                    self.purge_history(db::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        in_flight.retain(|h| !h.is_finished());
        if in_flight.is_empty() {
            info!("scheduler engine shutting down");
        } else {
            warn!(
                in_flight = in_flight.len(),
                "scheduler engine shutting down with firings in flight; they are reconciled on next start"
            );
        }
    }

    /// Undo what a dead process left behind: RUNNING jobs go back to IDLE and
    /// unfinished history records are closed as FAILED.
    pub async fn reconcile_on_startup(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let jobs = self.jobs.release_stale_claims(now).await?;
        let records = self.history.fail_in_flight(INTERRUPTED, now).await?;
        if jobs > 0 || records > 0 {
            warn!(jobs, records, "reconciled state left by a previous process");
        }
        Ok((jobs, records))
    }

    /// One pass over the due jobs. Only the `list_due` query can fail the
    /// tick; per-job errors are logged and the pass continues.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self.jobs.list_due(now).await?;
        let mut report = TickReport::default();
        for job in due {
            let id = job.id.clone();
            if let Err(e) = self.process_due(job, now, &mut report).await {
                error!(job_id = %id, "failed to process due job: {e}");
            }
        }
        Ok(report)
    }

    async fn process_due(&self, job: Job, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        if job.options.expired_at(now) {
            let reason = match job.options.end_date {
                Some(end) => format!("end date {end} has passed"),
                None => "end date has passed".to_string(),
            };
            info!(job_id = %job.id, name = %job.name, "job expired, disabling");
            self.jobs.disable(&job.id, Some(&reason), now).await?;
            report.disabled.push(job.id);
            return Ok(());
        }

        match self.check_dependencies(&job, now).await {
            Ok(()) => {}
            Err(SchedulerError::DependencyUnsatisfied { job_name }) => {
                let retry_at = now + self.config.gate_grace;
                self.jobs.reschedule(&job.id, retry_at, now).await?;
                warn!(
                    job_id = %job.id, name = %job.name, dependency = %job_name, %retry_at,
                    "dependency unsatisfied, deferring"
                );
                report.deferred.push(job.id);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        // a deferred job fires for the instant it was originally due
        let fired_at = job.due_at.or(job.next_run).unwrap_or(now);
        let next_run = match schedule::next_run(&job.schedule, job.anchor, fired_at, now) {
            Ok(t) => t,
            Err(e) => {
                error!(job_id = %job.id, schedule = %job.schedule, "unschedulable job, disabling: {e}");
                self.jobs.disable(&job.id, Some(&e.to_string()), now).await?;
                report.disabled.push(job.id);
                return Ok(());
            }
        };

        if !self.jobs.claim(&job.id, now).await? {
            debug!(job_id = %job.id, "claim lost, skipping");
            report.skipped.push(job.id);
            return Ok(());
        }

        let id = job.id.clone();
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.fire(job, fired_at, Some(next_run)).await });
        report.dispatched.push((id, handle));
        Ok(())
    }

    /// Every dependency needs a qualifying record of the named job inside its window.
    async fn check_dependencies(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        for dep in &job.options.dependencies {
            let since = now - chrono::Duration::hours(i64::from(dep.within_hours));
            let satisfied = match self.jobs.get_by_name(&dep.job_name).await? {
                Some(target) => {
                    self.history
                        .find_recent(&target.id, &[dep.required_status], since)
                        .await?
                }
                None => false,
            };
            if !satisfied {
                return Err(SchedulerError::DependencyUnsatisfied {
                    job_name: dep.job_name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Run one claimed firing and book the outcome onto the job.
    ///
    /// `next_run = None` leaves the job's planned time alone (run-now).
    pub(crate) async fn fire(
        &self,
        job: Job,
        fired_at: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> ExecutionOutcome {
        info!(job_id = %job.id, name = %job.name, task = %job.task, %fired_at, "dispatching job");
        let outcome = self.executor.execute(&job, fired_at).await;
        finish_firing(self.jobs.as_ref(), &job, fired_at, next_run, &outcome, self.config.tick).await;
        outcome
    }

    pub async fn purge_history(&self, now: DateTime<Utc>) {
        let Some(retention) = self.config.history_retention else {
            return;
        };
        match self.history.purge_before(now - retention).await {
            Ok(0) => {}
            Ok(n) => info!(deleted = n, "purged old execution records"),
            Err(e) => error!("history purge failed: {e}"),
        }
    }
}

/// Release the claim a firing holds and book its outcome onto the job.
///
/// The release is one conditional update, so a disable or edit made during
/// the firing survives it. Storage errors are retried a few times; giving up
/// leaves the job RUNNING until the next start reconciles it.
pub(crate) async fn finish_firing(
    jobs: &dyn JobStore,
    job: &Job,
    fired_at: DateTime<Utc>,
    next_run: Option<DateTime<Utc>>,
    outcome: &ExecutionOutcome,
    retry_delay: Duration,
) {
    let fatal = outcome
        .is_fatal()
        .then(|| outcome.error.as_ref().map(ToString::to_string))
        .flatten();
    if let Some(error) = &fatal {
        error!(job_id = %job.id, %error, "job disabled");
    }

    for attempt in 1..=FINISH_ATTEMPTS {
        let released = jobs
            .release(&job.id, fired_at, next_run, job.next_run, fatal.as_deref(), db::now())
            .await;
        match released {
            Ok(true) => {
                let status = match outcome.status {
                    ExecutionStatus::Completed => "completed",
                    _ => "failed",
                };
                info!(
                    job_id = %job.id, attempts = outcome.attempts, outcome = status,
                    next_run = ?next_run, "firing finished"
                );
                return;
            }
            Ok(false) => {
                info!(job_id = %job.id, "job was deleted during its firing");
                return;
            }
            Err(e) if attempt < FINISH_ATTEMPTS => {
                warn!(job_id = %job.id, attempt, "failed to record firing outcome, retrying: {e}");
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => error!(job_id = %job.id, "gave up recording firing outcome: {e}"),
        }
    }
}
