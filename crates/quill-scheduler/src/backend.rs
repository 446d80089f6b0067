//! Contracts for the collaborators that actually carry out jobs.
//!
//! The scheduler never knows how a post is made. It asks a
//! [`BackendHealth`] whether the automation backend is usable, hands claimed
//! jobs to a [`JobExecutor`], and pulls desired work from a [`JobSource`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use quill_ledger::{ErrorCategory, Job, NewJob};

use crate::SchedulerError;

/// What an executor reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub error: String,
    /// Executor-supplied classification. `None` defers to the text classifier.
    #[serde(default, deserialize_with = "deserialize_category")]
    pub category: Option<ErrorCategory>,
    #[serde(default, rename = "type")]
    pub error_type: String,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// An unclassified failure.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            ..Self::default()
        }
    }

    /// A failure the executor classified itself.
    pub fn classified(
        error: impl Into<String>,
        category: ErrorCategory,
        error_type: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: error.into(),
            category: Some(category),
            error_type: error_type.into(),
        }
    }
}

/// Accepts `"account"`, `"infrastructure"`, `"unknown"`, `""` or null.
fn deserialize_category<'de, D>(deserializer: D) -> Result<Option<ErrorCategory>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => ErrorCategory::parse_optional(&s).map_err(serde::de::Error::custom),
    }
}

/// Performs one attempt of a job. Must not retry internally.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, worker_id: &str, job: &Job) -> ExecutionResult;
}

/// Liveness probe and remediation for the automation backend.
#[async_trait]
pub trait BackendHealth: Send + Sync {
    async fn health_check(&self, worker_id: &str) -> bool;

    async fn restart(&self, worker_id: &str) -> bool;
}

/// External supply of desired work.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn source_jobs(&self) -> Result<Vec<NewJob>, SchedulerError>;
}
