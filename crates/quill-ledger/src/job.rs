//! Ledger record types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Held by exactly one worker.
    Claimed,
    /// Failed transiently, eligible for another claim after the retry delay.
    Retrying,
    /// Posted.
    Success,
    /// Terminal failure.
    Failed,
}

impl JobStatus {
    /// All statuses in ledger order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Claimed,
        JobStatus::Retrying,
        JobStatus::Success,
        JobStatus::Failed,
    ];

    /// The text stored in the ledger's `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Claimed => "CLAIMED",
            JobStatus::Retrying => "RETRYING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Whether a row may move from `self` to `next`.
    ///
    /// Claims come from PENDING or RETRYING; outcomes are only reported
    /// against CLAIMED rows. SUCCESS and FAILED never change again.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Claimed)
                | (JobStatus::Retrying, JobStatus::Claimed)
                | (JobStatus::Claimed, JobStatus::Success)
                | (JobStatus::Claimed, JobStatus::Retrying)
                | (JobStatus::Claimed, JobStatus::Failed)
        )
    }

    /// SUCCESS and FAILED rows are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{s}'"))
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Permanent problem with the account (suspended, banned, captcha, logged out).
    /// Never retried.
    Account,
    /// Transient problem with the automation backend or network.
    Infrastructure,
    /// Could not be classified. Retried unless disabled.
    Unknown,
}

impl ErrorCategory {
    /// The text stored in the ledger's `error_category` column.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Account => "account",
            ErrorCategory::Infrastructure => "infrastructure",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Parse a category column or collaborator tag. The empty string means
    /// "not classified".
    pub fn parse_optional(s: &str) -> Result<Option<Self>, String> {
        match s.trim() {
            "" => Ok(None),
            "account" => Ok(Some(ErrorCategory::Account)),
            "infrastructure" => Ok(Some(ErrorCategory::Infrastructure)),
            "unknown" => Ok(Some(ErrorCategory::Unknown)),
            other => Err(format!("unknown error category '{other}'")),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work bound to exactly one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub account: String,
    /// Opaque reference to the content to post.
    pub payload_ref: String,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Retries scheduled so far. Only grows.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_category: Option<ErrorCategory>,
    /// Free-form tag refining the category (e.g. `timeout`, `captcha`).
    pub error_type: String,
    pub pass_number: u32,
}

impl Job {
    /// Create a new pending job.
    pub fn pending(
        job_id: impl Into<String>,
        account: impl Into<String>,
        payload_ref: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            account: account.into(),
            payload_ref: payload_ref.into(),
            status: JobStatus::Pending,
            worker_id: None,
            claimed_at: None,
            completed_at: None,
            last_error: None,
            attempts: 0,
            max_attempts,
            last_attempt_at: None,
            error_category: None,
            error_type: String::new(),
            pass_number: 0,
        }
    }

    /// Most recent timestamp recorded on the row, if any.
    pub fn latest_activity(&self) -> Option<DateTime<Utc>> {
        [self.claimed_at, self.completed_at, self.last_attempt_at]
            .into_iter()
            .flatten()
            .max()
    }
}

/// Externally sourced description of desired work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub account: String,
    pub payload_ref: String,
}

impl NewJob {
    pub fn new(account: impl Into<String>, payload_ref: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            payload_ref: payload_ref.into(),
        }
    }
}

/// An outcome report against a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub job_id: String,
    pub status: JobStatus,
    pub worker_id: String,
    pub error: Option<String>,
    /// Caller-supplied classification. `None` falls back to the text classifier.
    pub category: Option<ErrorCategory>,
    pub error_type: Option<String>,
    pub pass_number: Option<u32>,
}

impl JobUpdate {
    /// Report a successful post.
    pub fn success(job_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Success,
            worker_id: worker_id.into(),
            error: None,
            category: None,
            error_type: None,
            pass_number: None,
        }
    }

    /// Report a failed attempt, moving the job to `status` (RETRYING or FAILED).
    pub fn failure(
        job_id: impl Into<String>,
        worker_id: impl Into<String>,
        status: JobStatus,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            worker_id: worker_id.into(),
            error: Some(error.into()),
            category: None,
            error_type: None,
            pass_number: None,
        }
    }

    /// Attach the collaborator's classification.
    pub fn classified(mut self, category: Option<ErrorCategory>, error_type: &str) -> Self {
        self.category = category;
        if !error_type.is_empty() {
            self.error_type = Some(error_type.to_string());
        }
        self
    }

    /// Record which retry pass produced this outcome.
    pub fn in_pass(mut self, pass_number: u32) -> Self {
        self.pass_number = Some(pass_number);
        self
    }
}
