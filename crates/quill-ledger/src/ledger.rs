//! The shared, file-persisted job ledger.
//!
//! Every operation takes the ledger's advisory lock, reads the whole file,
//! applies its change in memory and atomically rewrites the file before the
//! lock is released. Any number of processes may hold a [`Ledger`] on the
//! same path; the lock serializes them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, instrument};

use crate::LedgerError;
use crate::account::{AccountStates, CooldownPolicy};
use crate::job::{ErrorCategory, Job, JobStatus, JobUpdate, NewJob};
use crate::lease::LeaseFile;
use crate::storage::{FileLock, sibling, write_atomic};
use crate::table::{JobTable, LedgerStats};
use crate::tsv;

/// Default time to wait for the ledger lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// Default sleep between lock attempts.
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);
/// Default bound on stored error text, in characters.
pub const DEFAULT_MAX_ERROR_LEN: usize = 500;
/// Default `max_attempts` for seeded jobs.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Tunables for ledger access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerOptions {
    pub lock_timeout: Duration,
    pub lock_retry_interval: Duration,
    pub max_error_len: usize,
    pub default_max_attempts: u32,
    pub cooldown: CooldownPolicy,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
            max_error_len: DEFAULT_MAX_ERROR_LEN,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            cooldown: CooldownPolicy::default(),
        }
    }
}

/// Handle on a ledger file. Cheap to clone; holds no open files.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    lock_path: PathBuf,
    accounts_path: PathBuf,
    options: LedgerOptions,
}

impl Ledger {
    /// A handle on `path` without touching the filesystem.
    pub fn new(path: impl Into<PathBuf>, options: LedgerOptions) -> Self {
        let path = path.into();
        Self {
            lock_path: sibling(&path, ".lock"),
            accounts_path: sibling(&path, ".accounts.json"),
            path,
            options,
        }
    }

    /// Open a ledger, creating a header-only file if none exists.
    ///
    /// An existing file that is empty or cannot be parsed is reported as
    /// [`LedgerError::Invalid`] and left untouched.
    pub fn open(path: impl Into<PathBuf>, options: LedgerOptions) -> Result<Self, LedgerError> {
        let ledger = Self::new(path, options);
        let _lock = ledger.lock()?;
        if ledger.path.exists() {
            ledger.load_table()?;
        } else {
            write_atomic(&ledger.path, tsv::render(&[]).as_bytes())?;
            info!(path = %ledger.path.display(), "created empty ledger");
        }
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn accounts_path(&self) -> &Path {
        &self.accounts_path
    }

    pub fn options(&self) -> &LedgerOptions {
        &self.options
    }

    fn lock(&self) -> Result<FileLock, LedgerError> {
        FileLock::acquire(
            &self.lock_path,
            self.options.lock_timeout,
            self.options.lock_retry_interval,
        )
    }

    fn load_table(&self) -> Result<JobTable, LedgerError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::Missing {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let jobs = tsv::parse(&content).map_err(|reason| LedgerError::Invalid {
            path: self.path.clone(),
            reason,
        })?;
        Ok(JobTable::new(jobs))
    }

    /// Run `f` as one critical section, persisting whatever it changed.
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut JobTable, &mut AccountStates, DateTime<Utc>) -> T,
    ) -> Result<T, LedgerError> {
        let _lock = self.lock()?;
        let mut table = self.load_table()?;
        let mut accounts = AccountStates::load(&self.accounts_path)?;
        let (table_before, accounts_before) = (table.clone(), accounts.clone());

        let out = f(&mut table, &mut accounts, Utc::now());

        if table != table_before {
            write_atomic(&self.path, tsv::render(table.jobs()).as_bytes())?;
        }
        if accounts != accounts_before {
            accounts.save(&self.accounts_path)?;
        }
        Ok(out)
    }

    /// Read-only view under the lock.
    fn view<T>(
        &self,
        f: impl FnOnce(&JobTable, &AccountStates, DateTime<Utc>) -> T,
    ) -> Result<T, LedgerError> {
        let _lock = self.lock()?;
        let table = self.load_table()?;
        let accounts = AccountStates::load(&self.accounts_path)?;
        Ok(f(&table, &accounts, Utc::now()))
    }

    /// Check that the file parses.
    pub fn validate(&self) -> Result<(), LedgerError> {
        self.view(|_, _, _| ())
    }

    /// Claim the first eligible PENDING job for `worker_id`.
    #[instrument(skip(self), fields(ledger = %self.path.display()))]
    pub fn claim_next_job(
        &self,
        worker_id: &str,
        daily_limit: usize,
    ) -> Result<Option<Job>, LedgerError> {
        let job = self.transact(|table, accounts, now| {
            table.claim_next(worker_id, daily_limit, accounts, now)
        })?;
        if let Some(job) = &job {
            debug!(job_id = %job.job_id, account = %job.account, "claimed pending job");
        }
        Ok(job)
    }

    /// Claim one specific RETRYING job for `worker_id`.
    #[instrument(skip(self), fields(ledger = %self.path.display()))]
    pub fn claim_retry_job(
        &self,
        job_id: &str,
        worker_id: &str,
        daily_limit: usize,
    ) -> Result<Option<Job>, LedgerError> {
        let job = self.transact(|table, accounts, now| {
            table.claim_retry(job_id, worker_id, daily_limit, accounts, now)
        })?;
        if let Some(job) = &job {
            debug!(job_id = %job.job_id, account = %job.account, attempts = job.attempts, "claimed retry job");
        }
        Ok(job)
    }

    /// RETRYING jobs whose last attempt is at least `min_delay` old.
    pub fn get_retry_jobs(&self, min_delay: Duration) -> Result<Vec<Job>, LedgerError> {
        let min_delay = chrono::Duration::from_std(min_delay).unwrap_or(chrono::Duration::MAX);
        self.view(|table, _, now| table.retry_ready(min_delay, now))
    }

    /// Record the outcome of a claimed job.
    ///
    /// Also updates the account tracker in the same critical section: a
    /// success clears the account's failure counter and cooldown, an
    /// infrastructure failure counts towards the next cooldown. Returns
    /// `false` if the job is unknown or the transition is not allowed.
    #[instrument(skip(self, update), fields(job_id = %update.job_id, status = %update.status))]
    pub fn update_job_status(&self, update: &JobUpdate) -> Result<bool, LedgerError> {
        let max_error_len = self.options.max_error_len;
        let cooldown = self.options.cooldown;
        self.transact(|table, accounts, now| {
            let Some(job) = table.apply_update(update, max_error_len, now) else {
                return false;
            };
            match (job.status, job.error_category) {
                (JobStatus::Success, _) => {
                    accounts.record_success(&job.account);
                }
                (_, Some(ErrorCategory::Infrastructure)) => {
                    accounts.record_infra_failure(&job.account, now, &cooldown);
                }
                _ => {}
            }
            true
        })
    }

    /// Merge sourced jobs into the ledger. Returns the rows that were added.
    #[instrument(skip(self, new_jobs), fields(sourced = new_jobs.len()))]
    pub fn seed(&self, new_jobs: &[NewJob], daily_limit: usize) -> Result<Vec<Job>, LedgerError> {
        let max_attempts = self.options.default_max_attempts;
        let added = self.transact(|table, accounts, now| {
            table.seed(new_jobs, daily_limit, max_attempts, accounts, now)
        })?;
        info!(added = added.len(), sourced = new_jobs.len(), "seeded ledger");
        Ok(added)
    }

    /// Counts by status and category, plus accounts on cooldown.
    pub fn get_stats(&self) -> Result<LedgerStats, LedgerError> {
        self.view(|table, accounts, now| table.stats(accounts, now))
    }

    /// Snapshot of all rows.
    pub fn jobs(&self) -> Result<Vec<Job>, LedgerError> {
        self.view(|table, _, _| table.jobs().to_vec())
    }

    /// Newest timestamp on any row.
    pub fn latest_activity(&self) -> Result<Option<DateTime<Utc>>, LedgerError> {
        self.view(|table, _, _| table.latest_activity())
    }

    /// Account cooldown state.
    pub fn account_states(&self) -> Result<AccountStates, LedgerError> {
        let _lock = self.lock()?;
        AccountStates::load(&self.accounts_path)
    }

    /// Archive the current ledger under a dated name in `archive_dir` and
    /// start a fresh, header-only ledger.
    ///
    /// Refuses with [`LedgerError::LeaseHeld`] while another process holds a
    /// live lease. The current file is moved, never parsed, so an invalid
    /// ledger can be archived too. Same-day archives get a numeric suffix.
    #[instrument(skip(self, lease), fields(ledger = %self.path.display()))]
    pub fn reset_day(&self, archive_dir: &Path, lease: &LeaseFile) -> Result<PathBuf, LedgerError> {
        let _lock = self.lock()?;
        // The lease stays locked until the fresh ledger is in place, so no
        // scheduler can start claiming from the file being archived.
        lease.while_unheld(|| {
            if !self.path.exists() {
                return Err(LedgerError::Missing {
                    path: self.path.clone(),
                });
            }

            std::fs::create_dir_all(archive_dir)?;
            let date = Local::now().format("%Y-%m-%d").to_string();
            let archive = archive_path(&self.path, archive_dir, &date);
            std::fs::rename(&self.path, &archive)?;
            write_atomic(&self.path, tsv::render(&[]).as_bytes())?;

            info!(archive = %archive.display(), "archived ledger and started a fresh day");
            Ok(archive)
        })
    }
}

/// First free `<stem>-<date>[-n].<ext>` in `archive_dir`.
fn archive_path(ledger: &Path, archive_dir: &Path, date: &str) -> PathBuf {
    let stem = ledger
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    let ext = ledger
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut candidate = archive_dir.join(format!("{stem}-{date}{ext}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = archive_dir.join(format!("{stem}-{date}-{n}{ext}"));
        n += 1;
    }
    candidate
}
