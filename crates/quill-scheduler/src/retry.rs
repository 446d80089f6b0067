//! Retry passes.
//!
//! A run is a sequence of passes. During a pass the workers drain all
//! claimable work; at the end the ledger decides whether another pass is
//! worth starting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use quill_ledger::LedgerStats;

/// Counts recorded when a pass ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub pass_number: u32,
    pub total_jobs: usize,
    pub succeeded: usize,
    pub failed_account: usize,
    pub failed_infrastructure: usize,
    pub failed_unknown: usize,
    pub retrying: usize,
    pub pending: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// What the end of a pass means for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    /// Nothing pending or retrying is left.
    AllComplete,
    /// Retryable work remains but the pass budget is spent.
    MaxPassesReached,
    /// Sleep the retry delay and start another pass.
    RetryableRemaining,
}

/// Tracks pass numbers and history for one run.
#[derive(Debug, Clone)]
pub struct PassManager {
    pass_number: u32,
    max_passes: u32,
    history: Vec<PassStats>,
    current_start: Option<DateTime<Utc>>,
}

impl PassManager {
    pub fn new(max_passes: u32) -> Self {
        Self {
            pass_number: 0,
            max_passes,
            history: Vec::new(),
            current_start: None,
        }
    }

    pub fn pass_number(&self) -> u32 {
        self.pass_number
    }

    pub fn max_passes(&self) -> u32 {
        self.max_passes
    }

    pub fn history(&self) -> &[PassStats] {
        &self.history
    }

    pub fn into_history(self) -> Vec<PassStats> {
        self.history
    }

    /// Begin the next pass and return its number.
    pub fn start_new_pass(&mut self) -> u32 {
        self.pass_number += 1;
        self.current_start = Some(Utc::now());
        info!("========== pass {}/{} started ==========", self.pass_number, self.max_passes);
        self.pass_number
    }

    /// Close the current pass against the ledger's `stats`.
    #[instrument(skip(self, stats), fields(pass = self.pass_number))]
    pub fn end_pass(&mut self, stats: &LedgerStats) -> PassOutcome {
        let ended_at = Utc::now();
        let pass = PassStats {
            pass_number: self.pass_number,
            total_jobs: stats.total,
            succeeded: stats.success,
            failed_account: stats.failed_account,
            failed_infrastructure: stats.failed_infrastructure,
            failed_unknown: stats.failed_unknown,
            retrying: stats.retrying,
            pending: stats.pending,
            started_at: self.current_start.take().unwrap_or(ended_at),
            ended_at,
        };

        let outcome = if stats.retrying == 0 && stats.pending == 0 {
            PassOutcome::AllComplete
        } else if self.pass_number >= self.max_passes {
            PassOutcome::MaxPassesReached
        } else {
            PassOutcome::RetryableRemaining
        };

        info!(
            succeeded = pass.succeeded,
            failed_account = pass.failed_account,
            failed_infrastructure = pass.failed_infrastructure,
            failed_unknown = pass.failed_unknown,
            retrying = pass.retrying,
            pending = pass.pending,
            elapsed_secs = (pass.ended_at - pass.started_at).num_seconds(),
            ?outcome,
            "========== pass {}/{} ended ==========",
            self.pass_number,
            self.max_passes
        );
        self.history.push(pass);
        outcome
    }
}
