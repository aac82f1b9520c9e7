use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use hq_core::{
    config::{ensure_parent_dir, LoggingConfig},
    HqConfig,
};
use hq_scheduler::{
    db, EngineConfig, JobCreate, JobStatus, Page, SchedulerEngine, SchedulerHandle,
    SqliteHistoryStore, SqliteJobStore, TaskRegistry,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod tasks;

#[derive(Parser)]
#[command(name = "hq", about = "Job scheduler and executor", version)]
struct Cli {
    /// Config file (default: $HQ_CONFIG, then ~/.hq/hq.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run,
    /// List registered tasks
    Tasks,
    /// List jobs
    Jobs,
    /// Show a job's execution history, newest first
    History {
        job_id: String,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Run a job immediately and wait for it
    RunJob { job_id: String },
    /// Resume scheduling a disabled job
    Enable { job_id: String },
    /// Stop scheduling a job
    Disable { job_id: String },
    /// Delete a job (its history is kept)
    Delete { job_id: String },
    /// Execution analytics
    Stats {
        /// Days of daily history to show
        #[arg(short, long, default_value_t = 7)]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config > HQ_CONFIG env > ~/.hq/hq.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("HQ_CONFIG").ok());
    let (config, load_err) = match HqConfig::load(config_path.as_deref()) {
        Ok(c) => (c, None),
        Err(e) => (HqConfig::default(), Some(e)),
    };
    init_logging(&config.logging, config.debug)?;
    if let Some(e) = load_err {
        warn!("Config load failed ({e}), using defaults");
    }

    let engine = build_engine(&config)?;
    let handle = engine.handle();

    match cli.command {
        Commands::Run => {
            upsert_default_jobs(&handle, &config).await;

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let engine_task = tokio::spawn(engine.run(shutdown_rx));

            tokio::signal::ctrl_c().await?;
            info!("interrupt received, stopping scheduler");
            let _ = shutdown_tx.send(true);
            engine_task.await?;
        }
        Commands::Tasks => {
            for task in handle.list_tasks() {
                let params: Vec<String> = task
                    .params
                    .iter()
                    .map(|p| {
                        let opt = if p.required { "" } else { "?" };
                        format!("{}{opt}", p.name)
                    })
                    .collect();
                println!(
                    "{:<12} {:<12} [{}] {}",
                    task.name,
                    task.title,
                    params.join(", "),
                    task.description.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Jobs => {
            for job in handle.list_jobs().await? {
                let next = job.next_run.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
                println!(
                    "{}  {:<20} {:<10} {:<9} {:<28} next: {}",
                    job.id, job.name, job.task, job.status, job.schedule.to_string(), next
                );
                if let Some(err) = &job.last_error {
                    println!("    last error: {err}");
                }
            }
        }
        Commands::History { job_id, limit } => {
            let page = handle.job_history(&job_id, Page::first(limit)).await?;
            for r in &page.items {
                let took = r
                    .duration()
                    .map(|d| format!("{}ms", d.num_milliseconds()))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{}  attempt {}  {:<9} {:>8}  {}",
                    r.started_at.to_rfc3339(),
                    r.attempt,
                    r.status,
                    took,
                    r.error.as_deref().unwrap_or("")
                );
            }
            println!("{} of {} records", page.items.len(), page.total);
        }
        Commands::RunJob { job_id } => {
            let outcome = handle.run_job_now(&job_id).await?;
            println!("{} after {} attempt(s)", outcome.status, outcome.attempts);
            if let Some(result) = &outcome.result {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            if let Some(e) = &outcome.error {
                println!("error: {e}");
            }
        }
        Commands::Enable { job_id } => {
            let job = handle.enable_job(&job_id).await?;
            println!("{} enabled, next run {:?}", job.name, job.next_run);
        }
        Commands::Disable { job_id } => {
            let job = handle.disable_job(&job_id).await?;
            if job.status == JobStatus::Running {
                println!("{} will be disabled when its current run ends", job.name);
            } else {
                println!("{} disabled", job.name);
            }
        }
        Commands::Delete { job_id } => {
            handle.delete_job(&job_id).await?;
            println!("{job_id} deleted");
        }
        Commands::Stats { days } => {
            println!("error rate: {:.1}%", handle.error_rate().await? * 100.0);
            println!("\nby task:");
            for u in handle.task_distribution().await? {
                println!("  {:<12} jobs {:>3}  completed {:>5}  failed {:>5}", u.task, u.jobs, u.completed, u.failed);
            }
            println!("\nupcoming:");
            for job in handle.upcoming_executions(5).await? {
                if let Some(next) = job.next_run {
                    println!("  {}  {}", next.to_rfc3339(), job.name);
                }
            }
            println!("\ndaily:");
            for d in handle.daily_history(days, chrono::Utc::now().date_naive()).await? {
                println!("  {}  completed {:>5}  failed {:>5}", d.date, d.completed, d.failed);
            }
        }
    }
    Ok(())
}

/// `RUST_LOG` wins over the config; `logging.path` redirects output to a file.
fn init_logging(logging: &LoggingConfig, debug: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter(debug)));

    match &logging.path {
        Some(path) => {
            ensure_parent_dir(path)?;
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
    Ok(())
}

fn build_engine(config: &HqConfig) -> anyhow::Result<SchedulerEngine> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path)?;
    info!(path = %db_path, "opening SQLite database");

    // each store gets its own connection
    let jobs = SqliteJobStore::new(db::open(db_path)?)?;
    let history = SqliteHistoryStore::new(db::open(db_path)?)?;

    let mut registry = TaskRegistry::new();
    tasks::register_builtin(&mut registry)?;

    Ok(SchedulerEngine::new(
        Arc::new(registry),
        Arc::new(jobs),
        Arc::new(history),
        EngineConfig::from(&config.scheduler),
    ))
}

/// Create or refresh the `[[jobs]]` declared in config. Bad entries are
/// logged and skipped.
async fn upsert_default_jobs(handle: &SchedulerHandle, config: &HqConfig) {
    for raw in &config.jobs {
        let req: JobCreate = match serde_json::from_value(raw.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!("invalid default job definition: {e}");
                continue;
            }
        };
        let task = req.task.clone();
        match handle.ensure_default_job(req).await {
            Ok(job) => info!(job_id = %job.id, name = %job.name, "default job ready"),
            Err(e) => warn!(%task, code = e.code(), "default job rejected: {e}"),
        }
    }
}
