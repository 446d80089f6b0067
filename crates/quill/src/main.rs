//! Quill: multi-account posting scheduler
//!
//! Main binary with subcommands:
//! - `run`: Drive workers through retry passes until the ledger is drained
//! - `status`: Counts per status and category, cooldowns and lease owner
//! - `reset-day`: Archive the ledger and start a fresh day
//! - `seed-only`: Merge sourced jobs into the ledger without running workers
//! - `stop-all`: Ask every running orchestrator to stop

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quill_scheduler::command::DEFAULT_EXECUTE_TIMEOUT;
use quill_scheduler::config::{
    DEFAULT_DAILY_LIMIT, DEFAULT_INFRA_RETRY_LIMIT, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_PASSES,
    DEFAULT_RETRY_DELAY, DEFAULT_WORKERS,
};

mod commands;

/// Value parser for the switches that can also come from the environment
/// (`QUILL_RETRY_UNKNOWN`, `QUILL_AUTO_ROLLOVER`, `QUILL_ALLOW_DUPLICATE`).
/// Case-insensitive; an empty variable means off.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Multi-account posting scheduler", long_about = None)]
struct Cli {
    /// Job ledger file
    #[arg(long, global = true, env = "QUILL_LEDGER", default_value = "progress.tsv")]
    ledger: PathBuf,

    /// Where archived ledgers go (defaults to an `archive` directory next to the ledger)
    #[arg(long, global = true, env = "QUILL_ARCHIVE_DIR")]
    archive_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Per-account quota and per-job attempt budget.
#[derive(Args, Debug, Clone)]
pub(crate) struct QuotaArgs {
    /// Successful plus in-flight jobs allowed per account per day
    #[arg(long, env = "QUILL_DAILY_LIMIT", default_value_t = DEFAULT_DAILY_LIMIT)]
    pub daily_limit: usize,

    /// Retries allowed per job
    #[arg(long, env = "QUILL_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct RunArgs {
    /// Number of concurrent workers
    #[arg(long, env = "QUILL_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    #[command(flatten)]
    pub quota: QuotaArgs,

    /// Retry passes per run
    #[arg(long, env = "QUILL_MAX_PASSES", default_value_t = DEFAULT_MAX_PASSES)]
    pub max_passes: u32,

    /// Seconds to wait between passes
    #[arg(long, env = "QUILL_RETRY_DELAY", default_value_t = DEFAULT_RETRY_DELAY.as_secs())]
    pub retry_delay: u64,

    /// Seconds a failed job rests before it is retried (defaults to --retry-delay)
    #[arg(long, env = "QUILL_RETRY_MIN_DELAY")]
    pub retry_min_delay: Option<u64>,

    /// Retries allowed after infrastructure failures
    #[arg(long, env = "QUILL_INFRA_RETRY_LIMIT", default_value_t = DEFAULT_INFRA_RETRY_LIMIT)]
    pub infra_retry_limit: u32,

    /// Retry failures that could not be classified.
    /// Accepts "1", "true", "yes", "on" or "0", "false", "no", "off".
    #[arg(long, env = "QUILL_RETRY_UNKNOWN", value_parser = parse_bool_env, default_value = "true")]
    pub retry_unknown: bool,

    /// Shell command that executes one job (job JSON on stdin, result JSON on stdout)
    #[arg(long, env = "QUILL_EXECUTE_CMD")]
    pub execute_cmd: String,

    /// Shell command whose exit status reports backend health
    #[arg(long, env = "QUILL_HEALTH_CMD")]
    pub health_cmd: Option<String>,

    /// Shell command that restarts the backend
    #[arg(long, env = "QUILL_RESTART_CMD")]
    pub restart_cmd: Option<String>,

    /// Seconds before a job execution is abandoned as a timeout
    #[arg(long, env = "QUILL_EXECUTE_TIMEOUT", default_value_t = DEFAULT_EXECUTE_TIMEOUT.as_secs())]
    pub execute_timeout: u64,

    /// JSON file of jobs to seed at startup
    #[arg(long, env = "QUILL_JOBS_FILE")]
    pub jobs_file: Option<PathBuf>,

    /// Archive the ledger first when it belongs to an earlier day
    #[arg(long, env = "QUILL_AUTO_ROLLOVER", value_parser = parse_bool_env, default_value = "false")]
    pub auto_rollover: bool,

    /// Start even if another orchestrator is running (for automated tests)
    #[arg(long, env = "QUILL_ALLOW_DUPLICATE", value_parser = parse_bool_env, default_value = "false")]
    pub allow_duplicate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until the ledger is drained or the pass budget is spent
    Run(RunArgs),

    /// Show ledger counts, cooldowns and the lease owner
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Archive today's ledger and start a fresh one
    ResetDay,

    /// Seed the ledger from a jobs file without running workers
    SeedOnly {
        /// JSON file of jobs to seed
        #[arg(long, env = "QUILL_JOBS_FILE")]
        jobs_file: PathBuf,

        #[command(flatten)]
        quota: QuotaArgs,

        /// Discard today's ledger and seed from scratch (requires --reset-day)
        #[arg(long)]
        fresh: bool,

        /// Archive the current ledger before seeding
        #[arg(long)]
        reset_day: bool,
    },

    /// Request a stop and signal every running orchestrator
    StopAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "quill=info,quill_ledger=info,quill_scheduler=info".to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let paths = commands::Paths {
        ledger: cli.ledger,
        archive_dir: cli.archive_dir,
    };

    match cli.command {
        Commands::Run(args) => commands::run(&paths, args).await,
        Commands::Status { json } => commands::status(&paths, json),
        Commands::ResetDay => commands::reset_day(&paths).await,
        Commands::SeedOnly {
            jobs_file,
            quota,
            fresh,
            reset_day,
        } => commands::seed_only(&paths, jobs_file, quota, fresh, reset_day).await,
        Commands::StopAll => commands::stop_all(&paths),
    }
}
