use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_MS: u64 = 1_000; // scheduler poll cadence
pub const DEFAULT_GATE_GRACE_SECS: u64 = 30; // deferral for dependency-gated jobs
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CAP_SECS: u64 = 300; // retries never wait longer than 5 min
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 1_000; // cooperative cancel window before abort
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Top-level config (hq.toml + HQ_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HqConfig {
    /// Verbose logging (`debug` level) unless `logging.level` says otherwise.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Default job definitions, upserted at startup.
    ///
    /// Kept as raw JSON here; `hq-scheduler` decodes each entry into a
    /// `JobCreate` so this crate stays free of scheduler types.
    #[serde(default)]
    pub jobs: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "hq=info,hq_scheduler=debug".
    /// `RUST_LOG` takes precedence when set.
    pub level: Option<String>,
    /// Append logs to this file instead of stderr.
    pub path: Option<String>,
}

impl LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub fn filter(&self, debug: bool) -> String {
        match &self.level {
            Some(level) => level.clone(),
            None if debug => "hq=debug,hq_scheduler=debug,hq_core=debug".to_string(),
            None => "hq=info,hq_scheduler=info,hq_core=info".to_string(),
        }
    }
}

/// Tunables for the scheduler loop and executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_gate_grace_secs")]
    pub gate_grace_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "bool_true")]
    pub backoff_jitter: bool,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Execution records older than this are purged. 0 keeps everything.
    #[serde(default = "default_retention_days")]
    pub history_retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            gate_grace_secs: DEFAULT_GATE_GRACE_SECS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_secs: DEFAULT_BACKOFF_CAP_SECS,
            backoff_jitter: true,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
            history_retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}
fn default_gate_grace_secs() -> u64 {
    DEFAULT_GATE_GRACE_SECS
}
fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}
fn default_backoff_cap_secs() -> u64 {
    DEFAULT_BACKOFF_CAP_SECS
}
fn default_cancel_grace_ms() -> u64 {
    DEFAULT_CANCEL_GRACE_MS
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.hq/hq.db", home)
}

impl HqConfig {
    /// Load config from a TOML file with HQ_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.hq/hq.toml
    ///
    /// Nested keys use a double underscore: `HQ_SCHEDULER__TICK_MS=500`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: HqConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HQ_").split("__"))
            .extract()
            .map_err(|e| crate::error::HqError::Config(e.to_string()))?;

        tracing::debug!(path = %path, jobs = config.jobs.len(), "config loaded");
        Ok(config)
    }
}

/// Create the directory that will hold `path` (database or log file).
pub fn ensure_parent_dir(path: &str) -> crate::error::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.hq/hq.toml", home)
}
