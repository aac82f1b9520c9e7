//! `hq-scheduler`: job scheduling and execution engine with SQLite persistence.
//!
//! # Overview
//!
//! Tasks (named async callables) are registered in a [`registry::TaskRegistry`]
//! at startup. Jobs bind a task to parameters, a [`Schedule`] and
//! [`types::JobOptions`], and live in the `jobs` table. The
//! [`engine::SchedulerEngine`] ticks on a short period, claims each due job
//! (IDLE → RUNNING, a conditional UPDATE), checks its dependencies, and hands
//! it to the [`executor::Executor`], which runs attempts under a timeout with
//! exponential backoff between retries. Every attempt is one row in
//! `job_executions`.
//!
//! # Schedule variants
//!
//! | Variant                  | Behaviour                                          |
//! |--------------------------|----------------------------------------------------|
//! | `Interval`               | Every N seconds/minutes/hours/days/weeks/months/years |
//! | `Interval` with `at`     | Every N days or weeks at HH:MM UTC                 |
//! | `Expression`             | Five-field cron expression, UTC                    |

pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handle;
pub mod history;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{EngineConfig, SchedulerEngine, TickReport};
pub use error::{Result, SchedulerError};
pub use executor::{BackoffPolicy, ExecutionOutcome, Executor};
pub use handle::SchedulerHandle;
pub use history::{HistoryStore, Page, Paginated, SqliteHistoryStore};
pub use registry::{ParamKind, ParamSpec, Task, TaskContext, TaskHandler, TaskRegistry};
pub use store::{JobStore, SqliteJobStore};
pub use types::{
    ExecutionRecord, ExecutionStatus, Job, JobCreate, JobDependency, JobOptions, JobStatus,
    JobUpdate, Params, Schedule, TimeOfDay, TimeUnit,
};
