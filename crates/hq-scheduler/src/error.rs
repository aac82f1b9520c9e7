use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job references a task that is not in the registry. Fatal for that job.
    #[error("Unknown task: {name}")]
    UnknownTask { name: String },

    /// A task with this name was already registered.
    #[error("Duplicate task: {name}")]
    DuplicateTask { name: String },

    /// Malformed parameters, schedule or options. Rejected before persistence.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An attempt exceeded the job's timeout.
    #[error("Task timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The task body returned an error.
    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job is mid-firing and cannot be claimed again.
    #[error("Job is already running: {id}")]
    JobBusy { id: String },

    /// Scheduling deferral, not a failure: a dependency has no qualifying run.
    #[error("Dependency unsatisfied: {job_name}")]
    DependencyUnsatisfied { job_name: String },
}

impl SchedulerError {
    /// Short error code string for API/CLI consumers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::UnknownTask { .. } => "UNKNOWN_TASK",
            SchedulerError::DuplicateTask { .. } => "DUPLICATE_TASK",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::Timeout { .. } => "TIMEOUT",
            SchedulerError::TaskExecution(_) => "TASK_EXECUTION_ERROR",
            SchedulerError::Storage(_) => "STORAGE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::JobBusy { .. } => "JOB_BUSY",
            SchedulerError::DependencyUnsatisfied { .. } => "DEPENDENCY_UNSATISFIED",
        }
    }

    /// Whether the executor may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Timeout { .. } | SchedulerError::TaskExecution(_)
        )
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SchedulerError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
