//! Command-line surface: argument parsing and thin handlers over the queue
//! service and worker supervisor.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{self, ENV_DB_PATH};
use crate::error::{QueueError, Result};
use crate::models::{parse_timestamp, Job, JobSpec};
use crate::queue::QueueService;
use crate::shutdown::install_shutdown_handler;
use crate::store::SqliteStore;
use crate::worker::supervisor::WorkerSupervisor;
use crate::worker::WorkerRuntime;

#[derive(Parser, Debug)]
#[command(name = "queuectl", version)]
#[command(about = "Durable CLI-driven background job queue with retries and a dead letter queue")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue a new job for processing
    Enqueue {
        /// Job specification as a JSON object
        job_spec: Option<String>,
        /// Read the job specification from a file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Command to execute (alternative to JSON)
        #[arg(long)]
        command: Option<String>,
        /// Job id (auto-generated if not provided)
        #[arg(long = "id")]
        job_id: Option<String>,
        /// Job priority; higher values are processed first
        #[arg(long)]
        priority: Option<i64>,
        /// Maximum retry attempts after the first failure
        #[arg(long)]
        max_retries: Option<u32>,
        /// Job timeout in seconds
        #[arg(long = "timeout")]
        timeout_seconds: Option<u32>,
        /// Earliest time the job becomes eligible (ISO-8601)
        #[arg(long)]
        run_at: Option<String>,
    },
    /// List jobs with optional filtering and sorting
    List {
        /// Filter by job state (pending, processing, completed, failed, dead)
        #[arg(long)]
        state: Option<String>,
        /// Maximum number of jobs to show
        #[arg(long, default_value_t = 10)]
        limit: u32,
        /// Show jobs created at or after this ISO-8601 timestamp
        #[arg(long)]
        since: Option<String>,
        /// Sort field (created_at, updated_at, priority)
        #[arg(long, default_value = "created_at")]
        sort: String,
    },
    /// Show queue counts and worker liveness
    Status,
    /// Manage worker processes
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Manage the dead letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Read and write configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum WorkerCommands {
    /// Start worker processes
    Start {
        /// Number of worker processes
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Leave the workers running in the background
        #[arg(long)]
        detach: bool,
        /// Polling interval override in milliseconds
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
    /// Stop all running workers
    Stop,
    /// Run a single worker loop in this process
    #[command(hide = true)]
    Run {
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum DlqCommands {
    /// List dead-lettered jobs
    List {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Requeue a dead-lettered job as a fresh job
    Retry {
        dlq_id: String,
        /// Reuse the original job id instead of generating a new one
        #[arg(long)]
        same_id: bool,
    },
    /// Permanently delete dead-lettered jobs
    Purge {
        /// Only purge entries older than this many days
        #[arg(long)]
        older_than: Option<u32>,
        /// Confirm the purge
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the effective configuration
    List,
    /// Print one configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
}

/// Open the queue service, honoring the stored `db_path` redirect: the
/// bootstrap database (default location or `QUEUECTL_DB`) is consulted for
/// the key, and the real store is reopened there when it differs. An
/// explicit `QUEUECTL_DB` wins outright.
fn open_service() -> Result<QueueService> {
    let bootstrap_path = config::bootstrap_db_path();
    let store = SqliteStore::open(&bootstrap_path)?;
    if std::env::var(ENV_DB_PATH).is_ok() {
        return Ok(QueueService::new(store));
    }
    let configured = store.load_config()?.db_path;
    if configured == bootstrap_path {
        Ok(QueueService::new(store))
    } else {
        Ok(QueueService::new(SqliteStore::open(configured)?))
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Enqueue {
            job_spec,
            file,
            command,
            job_id,
            priority,
            max_retries,
            timeout_seconds,
            run_at,
        } => {
            let service = open_service()?;
            let inputs = usize::from(job_spec.is_some())
                + usize::from(file.is_some())
                + usize::from(command.is_some());
            if inputs > 1 {
                return Err(QueueError::Validation(
                    "choose exactly one input method: JSON string, --file, or --command".to_string(),
                ));
            }
            let new_id = if let Some(command) = command {
                service.enqueue_spec(JobSpec {
                    id: job_id,
                    command,
                    priority,
                    max_retries,
                    timeout_seconds,
                    run_at,
                })?
            } else if let Some(path) = file {
                service.enqueue_json(&std::fs::read_to_string(path)?)?
            } else if let Some(raw) = job_spec {
                service.enqueue_json(&raw)?
            } else {
                return Err(QueueError::Validation(
                    "provide a job specification via JSON string, --file, or --command".to_string(),
                ));
            };
            println!("Job enqueued with id: {}", new_id);
            Ok(())
        }

        Commands::List {
            state,
            limit,
            since,
            sort,
        } => {
            let service = open_service()?;
            let since = since.as_deref().map(parse_timestamp).transpose()?;
            let jobs = service.list_jobs(state.as_deref(), since, &sort, limit)?;
            print_job_table(&jobs);
            Ok(())
        }

        Commands::Status => {
            let service = open_service()?;
            let report = service.status()?;
            println!("Job counts:");
            println!("  pending:    {}", report.counts.pending);
            println!("  processing: {}", report.counts.processing);
            println!("  completed:  {}", report.counts.completed);
            println!("  failed:     {}", report.counts.failed);
            println!("  dead:       {}", report.counts.dead);
            println!("  dlq:        {}", report.counts.dlq);
            println!();
            println!("Active workers: {}", report.live_workers.len());
            for worker in &report.live_workers {
                println!(
                    "  {} (pid {}, host {})",
                    worker.worker_id, worker.pid, worker.hostname
                );
            }
            if !report.recent_failures.is_empty() {
                println!();
                println!("Recent failures:");
                for job in &report.recent_failures {
                    let error = job.last_error.as_deref().unwrap_or("");
                    println!("  {}: {}", job.id, preview(error, 60));
                }
            }
            Ok(())
        }

        Commands::Worker { command } => match command {
            WorkerCommands::Start {
                count,
                detach,
                poll_interval_ms,
            } => {
                let service = open_service()?;
                let supervisor = WorkerSupervisor::new(service.store().db_path());
                let shutdown = install_shutdown_handler();
                if detach {
                    println!("Starting {} worker processes in the background", count);
                } else {
                    println!("Starting {} worker processes (Ctrl+C to stop)", count);
                }
                supervisor
                    .start(&service, count, poll_interval_ms, detach, shutdown)
                    .await
            }
            WorkerCommands::Stop => {
                let service = open_service()?;
                let supervisor = WorkerSupervisor::new(service.store().db_path());
                supervisor.stop(&service).await?;
                println!("All workers stopped");
                Ok(())
            }
            WorkerCommands::Run { poll_interval_ms } => {
                let service = open_service()?;
                let shutdown = install_shutdown_handler();
                WorkerRuntime::new(service, shutdown)
                    .with_poll_interval_ms(poll_interval_ms)
                    .run()
                    .await
            }
        },

        Commands::Dlq { command } => match command {
            DlqCommands::List { limit } => {
                let service = open_service()?;
                let entries = service.list_dlq(limit)?;
                if entries.is_empty() {
                    println!("No jobs in the dead letter queue");
                    return Ok(());
                }
                println!(
                    "{:<38} {:<38} {:<30} {:<8} {:<20}",
                    "DLQ ID", "ORIGINAL ID", "COMMAND", "ATTEMPTS", "MOVED AT"
                );
                for entry in &entries {
                    println!(
                        "{:<38} {:<38} {:<30} {:<8} {:<20}",
                        entry.dlq_id,
                        entry.original_job_id,
                        preview(&entry.command, 30),
                        entry.attempts,
                        entry.moved_at.format("%Y-%m-%d %H:%M:%S"),
                    );
                }
                Ok(())
            }
            DlqCommands::Retry { dlq_id, same_id } => {
                let service = open_service()?;
                let new_id = service.retry_dlq(&dlq_id, same_id)?;
                println!("Job requeued with id: {}", new_id);
                Ok(())
            }
            DlqCommands::Purge { older_than, force } => {
                if !force {
                    return Err(QueueError::Validation(
                        "purge permanently deletes DLQ entries; pass --force to confirm"
                            .to_string(),
                    ));
                }
                let service = open_service()?;
                let purged = service.purge_dlq(older_than)?;
                println!("Purged {} DLQ entries", purged);
                Ok(())
            }
        },

        Commands::Config { command } => match command {
            ConfigCommands::List => {
                let service = open_service()?;
                let stored = service.store().stored_config()?;
                for (key, value) in crate::config::QueueConfig::effective_entries(&stored) {
                    println!("{} = {}", key, value);
                }
                Ok(())
            }
            ConfigCommands::Get { key } => {
                let service = open_service()?;
                let declared = config::lookup_key(&key)?;
                let value = service
                    .store()
                    .get_config(&key)?
                    .unwrap_or_else(|| declared.default.to_string());
                println!("{}", value);
                Ok(())
            }
            ConfigCommands::Set { key, value } => {
                let service = open_service()?;
                config::validate_value(&key, &value)?;
                service.store().set_config(&key, &value)?;
                println!("Set {} = {}", key, value);
                Ok(())
            }
        },
    }
}

fn print_job_table(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs found");
        return;
    }
    println!(
        "{:<38} {:<12} {:<30} {:<8} {:<20}",
        "ID", "STATE", "COMMAND", "ATTEMPTS", "CREATED"
    );
    for job in jobs {
        println!(
            "{:<38} {:<12} {:<30} {:<8} {:<20}",
            job.id,
            job.state,
            preview(&job.command, 30),
            job.attempts,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
