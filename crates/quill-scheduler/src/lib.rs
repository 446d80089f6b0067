//! Worker pool, retry passes and leadership for the quill job ledger.
//!
//! This crate provides:
//! - Collaborator traits for executing jobs, probing the backend and sourcing
//!   work, plus a subprocess-backed implementation
//! - A worker loop with health checks and backend restarts
//! - Retry passes that drain the ledger until nothing retryable is left
//! - Leadership: lease heartbeat, duplicate-instance guard and stop requests
//! - Day rollover and an operator status report

pub mod backend;
pub mod command;
pub mod config;
pub mod context;
mod error;
pub mod guard;
pub mod heartbeat;
pub mod orchestrator;
pub mod retry;
pub mod rollover;
pub mod shutdown;
pub mod status;
pub mod worker;

pub use backend::{BackendHealth, ExecutionResult, JobExecutor, JobSource};
pub use command::{CommandBackend, FileJobSource};
pub use config::SchedulerConfig;
pub use context::SchedulerContext;
pub use error::SchedulerError;
pub use guard::{InstanceGuard, InstanceSignature};
pub use orchestrator::{Orchestrator, RunOutcome, RunSummary, SeedSummary, StopReport};
pub use retry::{PassManager, PassOutcome, PassStats};
pub use shutdown::{Shutdown, StopFile};
pub use status::{LeaseStatus, StatusReport};
pub use worker::{PassScope, Worker, WorkerReport, outcome_update};
