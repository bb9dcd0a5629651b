//! Takeoff: delayed user notifications
//!
//! Main binary with subcommands:
//! - `serve`: HTTP API plus dispatcher workers
//! - `jobs`: Inspect stored jobs by state
//! - `requeue`: Give an abandoned job another round of attempts

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use takeoff_scheduler::config::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BATCH_SIZE, DEFAULT_EXECUTOR_TIMEOUT_MS,
    DEFAULT_FIRST_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_STALE_GRACE_MS, DEFAULT_VISIBILITY_TIMEOUT_MS, DEFAULT_WINDOW_END_HOUR,
    DEFAULT_WINDOW_START_HOUR,
};
use takeoff_scheduler::{JobId, JobState, SchedulerConfig, SqliteJobStore};

mod daemon;
mod server;

#[derive(Parser)]
#[command(name = "takeoff")]
#[command(about = "Delayed notification scheduler", long_about = None)]
struct Cli {
    /// SQLite job database path
    #[arg(long, global = true, env = "TAKEOFF_DB", default_value = "takeoff.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the dispatcher workers
    Serve {
        /// Endpoint notifications are posted to
        #[arg(long, env = "TAKEOFF_NOTIFY_URL")]
        notify_url: String,

        /// HTTP listen address
        #[arg(long, env = "TAKEOFF_LISTEN", default_value = "0.0.0.0:8080")]
        listen: String,

        #[command(flatten)]
        scheduler: SchedulerArgs,
    },

    /// List stored jobs in a given state
    Jobs {
        /// One of pending, in_flight, completed, failed, abandoned
        #[arg(long, default_value = "abandoned")]
        state: JobState,

        /// Maximum number of jobs to print
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Return an abandoned or failed job to the queue with fresh attempts
    Requeue {
        /// Job id as printed by `jobs`
        #[arg(value_name = "ID")]
        id: i64,
    },
}

/// Scheduler tuning, each field overridable from the environment.
#[derive(Args)]
struct SchedulerArgs {
    /// Delivery attempts before a job is abandoned
    #[arg(long, env = "TAKEOFF_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Exponential backoff base in milliseconds
    #[arg(long, env = "TAKEOFF_BACKOFF_BASE_MS", default_value_t = DEFAULT_BACKOFF_BASE_MS)]
    backoff_base_ms: u64,

    /// Job priority (lower runs first among equally due jobs)
    #[arg(long, env = "TAKEOFF_PRIORITY", default_value_t = 0)]
    priority: i64,

    /// Keep completed jobs in the database instead of deleting them
    #[arg(long, env = "TAKEOFF_KEEP_COMPLETED")]
    keep_completed: bool,

    /// Delay before the first notification in milliseconds
    #[arg(long, env = "TAKEOFF_FIRST_DELAY_MS", default_value_t = DEFAULT_FIRST_DELAY_MS)]
    first_delay_ms: u64,

    /// Local hour the notification window opens
    #[arg(long, env = "TAKEOFF_WINDOW_START_HOUR", default_value_t = DEFAULT_WINDOW_START_HOUR)]
    window_start_hour: u32,

    /// Local hour the notification window closes
    #[arg(long, env = "TAKEOFF_WINDOW_END_HOUR", default_value_t = DEFAULT_WINDOW_END_HOUR)]
    window_end_hour: u32,

    /// Notification request timeout in milliseconds
    #[arg(long, env = "TAKEOFF_EXECUTOR_TIMEOUT_MS", default_value_t = DEFAULT_EXECUTOR_TIMEOUT_MS)]
    executor_timeout_ms: u64,

    /// How late a notification may still be delivered, in milliseconds
    #[arg(long, env = "TAKEOFF_STALE_GRACE_MS", default_value_t = DEFAULT_STALE_GRACE_MS)]
    stale_grace_ms: u64,

    /// Upper bound on the dispatcher's idle sleep in milliseconds
    #[arg(long, env = "TAKEOFF_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,

    /// Jobs claimed per poll
    #[arg(long, env = "TAKEOFF_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// How long a claim stays valid in milliseconds
    #[arg(long, env = "TAKEOFF_VISIBILITY_TIMEOUT_MS", default_value_t = DEFAULT_VISIBILITY_TIMEOUT_MS)]
    visibility_timeout_ms: u64,

    /// Concurrent dispatcher loops
    #[arg(long, env = "TAKEOFF_WORKERS", default_value_t = 1)]
    workers: usize,
}

impl From<SchedulerArgs> for SchedulerConfig {
    fn from(args: SchedulerArgs) -> Self {
        Self {
            max_attempts: args.max_attempts,
            backoff_base_ms: args.backoff_base_ms,
            priority: args.priority,
            remove_on_complete: !args.keep_completed,
            first_delay_ms: args.first_delay_ms,
            window_start_hour: args.window_start_hour,
            window_end_hour: args.window_end_hour,
            executor_timeout_ms: args.executor_timeout_ms,
            stale_grace_ms: args.stale_grace_ms,
            poll_interval_ms: args.poll_interval_ms,
            batch_size: args.batch_size,
            visibility_timeout_ms: args.visibility_timeout_ms,
            workers: args.workers,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "takeoff=info,takeoff_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            notify_url,
            listen,
            scheduler,
        } => {
            daemon::run(daemon::DaemonConfig {
                db_path: cli.db,
                notify_url,
                listen,
                scheduler: scheduler.into(),
            })
            .await
        }

        Commands::Jobs { state, limit } => list_jobs(&cli.db, state, limit),

        Commands::Requeue { id } => requeue_job(&cli.db, JobId(id)),
    }
}

fn open_store(db: &Path) -> Result<SqliteJobStore> {
    SqliteJobStore::open(db).map_err(|e| miette::miette!("failed to open job store: {}", e))
}

fn list_jobs(db: &Path, state: JobState, limit: usize) -> Result<()> {
    let store = open_store(db)?;
    let jobs = store
        .list(state, limit)
        .map_err(|e| miette::miette!("{}", e))?;

    if jobs.is_empty() {
        println!("No {} jobs.", state);
        return Ok(());
    }

    for job in jobs {
        println!(
            "{}\t{}\t{}\tattempt {}/{}\t{}\t{}",
            job.id,
            job.key,
            job.state,
            job.attempt,
            job.max_attempts,
            job.scheduled_at.to_rfc3339(),
            job.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn requeue_job(db: &Path, id: JobId) -> Result<()> {
    let store = open_store(db)?;
    let requeued = store.requeue(id).map_err(|e| miette::miette!("{}", e))?;

    if requeued {
        println!("Requeued job {}.", id);
    } else {
        println!("Job {} is not abandoned or failed; nothing to do.", id);
    }
    Ok(())
}
