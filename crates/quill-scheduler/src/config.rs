//! Scheduler tunables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use quill_ledger::{CooldownPolicy, DEFAULT_STALE_THRESHOLD, LedgerOptions};

use crate::SchedulerError;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 1;

/// Default successful-plus-claimed jobs per account per day.
pub const DEFAULT_DAILY_LIMIT: usize = 1;

/// Default number of retry passes per run.
pub const DEFAULT_MAX_PASSES: u32 = 5;

/// Default sleep between passes.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Default `max_attempts` for newly seeded jobs.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default cap on retries after infrastructure failures.
pub const DEFAULT_INFRA_RETRY_LIMIT: u32 = 5;

/// Consecutive failed health checks before a backend restart.
pub const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 3;

/// Default wait after a failed backend restart.
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(60);

/// Default worker sleep when nothing is claimable.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_secs(1);

/// Default lease heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default consecutive infrastructure failures before an account cooldown.
pub const DEFAULT_COOLDOWN_THRESHOLD: u32 = 3;

/// Everything a scheduler run can be tuned with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub ledger_path: PathBuf,
    pub workers: usize,
    pub daily_limit: usize,
    pub max_passes: u32,
    /// Sleep between passes.
    pub retry_delay: Duration,
    /// Minimum age of a RETRYING job's last attempt before it is picked up again.
    pub retry_min_delay: Duration,
    pub max_attempts: u32,
    pub infra_retry_limit: u32,
    pub retry_unknown: bool,
    pub health_failure_threshold: u32,
    pub restart_backoff: Duration,
    pub idle_sleep: Duration,
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
    pub cooldown_threshold: u32,
    /// Archive the ledger on startup when its activity is from an earlier day.
    pub auto_rollover: bool,
    pub archive_dir: PathBuf,
    /// Skip the duplicate-instance guard.
    pub allow_duplicate: bool,
}

impl SchedulerConfig {
    /// Defaults for a ledger at `ledger_path`.
    pub fn new(ledger_path: impl Into<PathBuf>) -> Self {
        let ledger_path = ledger_path.into();
        Self {
            archive_dir: default_archive_dir(&ledger_path),
            ledger_path,
            workers: DEFAULT_WORKERS,
            daily_limit: DEFAULT_DAILY_LIMIT,
            max_passes: DEFAULT_MAX_PASSES,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_min_delay: DEFAULT_RETRY_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            infra_retry_limit: DEFAULT_INFRA_RETRY_LIMIT,
            retry_unknown: true,
            health_failure_threshold: DEFAULT_HEALTH_FAILURE_THRESHOLD,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            cooldown_threshold: DEFAULT_COOLDOWN_THRESHOLD,
            auto_rollover: false,
            allow_duplicate: false,
        }
    }

    /// Reject values that would make the run meaningless or unsafe.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.workers == 0 {
            return Err(SchedulerError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.daily_limit == 0 {
            return Err(SchedulerError::InvalidConfig(
                "daily limit must be at least 1".into(),
            ));
        }
        if self.max_passes == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max passes must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval >= self.stale_threshold {
            return Err(SchedulerError::InvalidConfig(format!(
                "heartbeat interval ({}s) must be shorter than the stale threshold ({}s)",
                self.heartbeat_interval.as_secs(),
                self.stale_threshold.as_secs()
            )));
        }
        Ok(())
    }

    /// Ledger options derived from this configuration.
    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            default_max_attempts: self.max_attempts,
            cooldown: CooldownPolicy {
                threshold: self.cooldown_threshold,
                ..CooldownPolicy::default()
            },
            ..LedgerOptions::default()
        }
    }

    /// The retry cap that applies to infrastructure failures of a job.
    pub fn infra_cap(&self, job_max_attempts: u32) -> u32 {
        job_max_attempts.min(self.infra_retry_limit)
    }
}

/// `<ledger dir>/archive`.
pub fn default_archive_dir(ledger_path: &Path) -> PathBuf {
    ledger_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("archive")
}
