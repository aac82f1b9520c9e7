use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Named task parameters: name → JSON value.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Granularity of an interval schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    /// Advance `from` by `n` units. Months and years use calendar arithmetic
    /// (Jan 31 + 1 month = Feb 28/29); the rest are fixed durations.
    ///
    /// Returns `None` on overflow.
    pub fn advance(self, from: DateTime<Utc>, n: u32) -> Option<DateTime<Utc>> {
        let n64 = i64::from(n);
        match self {
            TimeUnit::Seconds => from.checked_add_signed(Duration::try_seconds(n64)?),
            TimeUnit::Minutes => from.checked_add_signed(Duration::try_minutes(n64)?),
            TimeUnit::Hours => from.checked_add_signed(Duration::try_hours(n64)?),
            TimeUnit::Days => from.checked_add_signed(Duration::try_days(n64)?),
            TimeUnit::Weeks => from.checked_add_signed(Duration::try_weeks(n64)?),
            TimeUnit::Months => from.checked_add_months(Months::new(n)),
            TimeUnit::Years => from.checked_add_months(Months::new(n.checked_mul(12)?)),
        }
    }

    /// Time-of-day anchoring only makes sense for day-or-longer periods.
    pub fn supports_at(self) -> bool {
        matches!(self, TimeUnit::Days | TimeUnit::Weeks)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
            TimeUnit::Years => "years",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock time of day (UTC) in `HH:MM` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn as_naive(self) -> NaiveTime {
        // hour/minute are range-checked on construction
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let err = || format!("'at' must be in HH:MM format (00:00-23:59), got {s:?}");
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        let hour: u8 = h.parse().map_err(|_| err())?;
        let minute: u8 = m.parse().map_err(|_| err())?;
        TimeOfDay::new(hour, minute).ok_or_else(err)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Defines when and how often a job should run.
///
/// Serialised untagged: an interval schedule is an object
/// (`{"interval": 2, "unit": "hours"}`), an expression schedule is a bare
/// cron string (`"*/15 * * * *"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Schedule {
    /// Every `interval` units, optionally pinned to a time of day (days/weeks only).
    Interval {
        interval: u32,
        unit: TimeUnit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<TimeOfDay>,
    },

    /// Five-field cron expression, evaluated in UTC.
    Expression(String),
}

impl Schedule {
    pub fn every(interval: u32, unit: TimeUnit) -> Self {
        Schedule::Interval {
            interval,
            unit,
            at: None,
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Expression(expression.into())
    }
}

/// Precondition on another job's recent history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDependency {
    /// Name of the job that must have run.
    pub job_name: String,
    #[serde(default = "default_required_status")]
    pub required_status: ExecutionStatus,
    /// Look-back window measured from the gate check.
    pub within_hours: u32,
}

fn default_required_status() -> ExecutionStatus {
    ExecutionStatus::Completed
}

/// Per-job execution options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Wall-clock limit for one attempt, in seconds. `None` means unbounded.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Attempts allowed after the first failure.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Ordered; every entry must be satisfied before dispatch.
    #[serde(default)]
    pub dependencies: Vec<JobDependency>,
}

impl JobOptions {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// True once `end_date` lies strictly before `now`.
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| end < now)
    }
}

/// Scheduling state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its next_run time.
    Idle,
    /// A firing is in flight; the loop will not dispatch it again.
    Running,
    /// Skipped by the loop (disabled by an operator, expired, or broken).
    Disabled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Disabled => "disabled",
        };
        f.pad(s)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobStatus::Idle),
            "running" => Ok(JobStatus::Running),
            "disabled" => Ok(JobStatus::Disabled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Lifecycle state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        f.pad(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// UUID v4 string (or a content hash for config-defined jobs); primary key.
    pub id: String,
    /// Unique human-readable label; dependencies refer to jobs by this name.
    pub name: String,
    /// Registered task name.
    pub task: String,
    pub params: Params,
    pub schedule: Schedule,
    pub options: JobOptions,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Firing time of the most recent completed invocation.
    pub last_run: Option<DateTime<Utc>>,
    /// Next planned firing. Present whenever the job is enabled.
    pub next_run: Option<DateTime<Utc>>,
    /// Scheduled instant a dependency deferral moved `next_run` away from.
    /// The firing that eventually happens keeps the grid from here.
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    /// Origin of the current schedule (creation, schedule edit or re-enable).
    /// Calendar intervals count whole steps from it.
    pub anchor: DateTime<Utc>,
    /// Why the job was disabled by the engine, if it was.
    pub last_error: Option<String>,
}

/// Job-creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreate {
    /// Defaults to the task name when omitted.
    #[serde(default)]
    pub name: Option<String>,
    pub task: String,
    #[serde(default)]
    pub params: Params,
    pub schedule: Schedule,
    #[serde(default)]
    pub options: JobOptions,
}

/// Partial job edit. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub params: Option<Params>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub options: Option<JobOptions>,
}

/// One execution attempt of one firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// UUID v4 string; primary key.
    pub id: String,
    pub job_id: String,
    /// Task name at the time of the attempt.
    pub task: String,
    /// Shared by all attempts of the same firing.
    pub firing_id: String,
    /// Zero-based attempt index within the firing.
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn duration(&self) -> Option<Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
