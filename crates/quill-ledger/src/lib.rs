//! File-persisted job ledger for quill.
//!
//! This crate provides:
//! - A tab-separated job ledger shared by any number of processes, with every
//!   mutation serialized by an advisory lock around a read/mutate/rewrite cycle
//! - Claim rules that enforce one active job per account and a daily quota
//! - Per-account cooldowns after repeated infrastructure failures
//! - A leadership lease with heartbeat, and day archival
//! - A keyword classifier used when a failure arrives unclassified

pub mod account;
pub mod classify;
mod error;
pub mod job;
pub mod lease;
mod ledger;
pub mod process;
pub mod storage;
pub mod table;
pub mod tsv;

pub use account::{AccountState, AccountStates, Cooldown, CooldownPolicy};
pub use classify::{Classification, classify_error};
pub use error::LedgerError;
pub use job::{ErrorCategory, Job, JobStatus, JobUpdate, NewJob};
pub use lease::{DEFAULT_STALE_THRESHOLD, Lease, LeaseFile};
pub use ledger::{
    DEFAULT_LOCK_RETRY_INTERVAL, DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_ERROR_LEN, Ledger, LedgerOptions,
};
pub use process::{FakeProcessTable, ProcessInfo, ProcessTable, SystemProcessTable, ancestors};
pub use table::{AccountUsage, JobTable, LedgerStats, local_day};
