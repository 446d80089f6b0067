//! Error types for the scheduler.

use thiserror::Error;

use quill_ledger::LedgerError;

/// Errors that can occur while running or controlling the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Ledger or lease error.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another orchestrator process is already running.
    #[error(
        "another quill orchestrator is already running (pid {pid}: {command}); \
         stop it with `quill stop-all` or set QUILL_ALLOW_DUPLICATE=1 to override"
    )]
    DuplicateInstance { pid: u32, command: String },

    /// A live scheduler lease is held by another process.
    #[error(
        "scheduler lease is held by live process {pid}; \
         stop it with `quill stop-all` before starting another scheduler"
    )]
    LeaseRefused { pid: u32 },

    /// A fresh reseed was requested without archiving the current day first.
    #[error("refusing to reseed from scratch without --reset-day; today's ledger would be lost")]
    UnsafeReseed,

    /// Another process took over the lease while this one was running.
    #[error("scheduler lease was lost to another process")]
    LeaseLost,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An external collaborator (job source, backend command) failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SchedulerError {
    /// Failures where the scheduler refused to act to protect ledger state.
    ///
    /// These map to exit code 1 with an actionable message.
    pub fn is_safety_failure(&self) -> bool {
        matches!(
            self,
            SchedulerError::DuplicateInstance { .. }
                | SchedulerError::LeaseRefused { .. }
                | SchedulerError::UnsafeReseed
                | SchedulerError::Ledger(LedgerError::Invalid { .. })
                | SchedulerError::Ledger(LedgerError::LeaseHeld { .. })
        )
    }

    /// Ledger failures worth retrying after a short pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulerError::Ledger(LedgerError::LockTimeout { .. })
                | SchedulerError::Ledger(LedgerError::Io(_))
        )
    }

    /// Convert a lease refusal into the scheduler-level error.
    pub(crate) fn from_lease(err: LedgerError) -> Self {
        match err {
            LedgerError::LeaseHeld { pid } => SchedulerError::LeaseRefused { pid },
            other => SchedulerError::Ledger(other),
        }
    }
}
