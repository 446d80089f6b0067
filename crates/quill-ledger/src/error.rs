//! Error types for the ledger.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in ledger and lease operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (account state or lease file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The ledger file exists but cannot be used as-is.
    ///
    /// The file is left untouched; an operator has to archive it explicitly.
    #[error(
        "ledger {} is invalid: {reason}; run `quill reset-day` to archive it and start a fresh ledger",
        path.display()
    )]
    Invalid { path: PathBuf, reason: String },

    /// The ledger file does not exist.
    #[error("ledger {} does not exist", path.display())]
    Missing { path: PathBuf },

    /// Gave up waiting for an advisory lock.
    #[error("timed out after {waited_ms}ms waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// A live lease is held by another process.
    #[error("lease is held by live process {pid}; another scheduler is running")]
    LeaseHeld { pid: u32 },
}
