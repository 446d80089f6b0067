//! Everything a scheduler run needs, built once and passed around.

use std::sync::Arc;

use quill_ledger::{LeaseFile, Ledger, LedgerError, ProcessTable, SystemProcessTable};

use crate::backend::{BackendHealth, JobExecutor, JobSource};
use crate::config::SchedulerConfig;
use crate::SchedulerError;
use crate::shutdown::{Shutdown, StopFile};

/// Shared state of one scheduler process.
///
/// Workers, the pass manager and the orchestrator all receive the same
/// `Arc<SchedulerContext>`. The ledger and lease are file handles, so the
/// context itself holds no mutable state apart from the shutdown flag.
pub struct SchedulerContext {
    pub config: SchedulerConfig,
    pub ledger: Ledger,
    pub lease: LeaseFile,
    pub stop_file: StopFile,
    pub executor: Arc<dyn JobExecutor>,
    pub health: Arc<dyn BackendHealth>,
    pub source: Option<Arc<dyn JobSource>>,
    pub processes: Arc<dyn ProcessTable>,
    pub shutdown: Shutdown,
}

impl std::fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("config", &self.config)
            .field("ledger", &self.ledger)
            .field("lease", &self.lease)
            .field("has_source", &self.source.is_some())
            .finish_non_exhaustive()
    }
}

impl SchedulerContext {
    /// Context for the real process table and the current pid.
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn JobExecutor>,
        health: Arc<dyn BackendHealth>,
    ) -> Self {
        let ledger = Ledger::new(&config.ledger_path, config.ledger_options());
        let processes: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable);
        let lease = LeaseFile::for_ledger(&config.ledger_path)
            .with_stale_threshold(config.stale_threshold)
            .with_process_table(processes.clone());
        let stop_file = StopFile::for_ledger(&config.ledger_path);
        Self {
            config,
            ledger,
            lease,
            stop_file,
            executor,
            health,
            source: None,
            processes,
            shutdown: Shutdown::new(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn JobSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Swap the process table used by the lease and the instance guard.
    pub fn with_process_table(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.lease = self.lease.with_process_table(processes.clone());
        self.processes = processes;
        self
    }

    /// Act as process `pid` when taking the lease and scanning for peers.
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.lease = self.lease.with_owner_pid(pid);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn owner_pid(&self) -> u32 {
        self.lease.owner_pid()
    }

    /// Run a blocking ledger operation off the async runtime.
    pub async fn ledger_call<T, F>(&self, f: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(&Ledger) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.ledger.clone();
        Ok(tokio::task::spawn_blocking(move || f(&ledger)).await??)
    }

    /// Run a blocking lease operation off the async runtime.
    pub async fn lease_call<T, F>(&self, f: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(&LeaseFile) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let lease = self.lease.clone();
        tokio::task::spawn_blocking(move || f(&lease))
            .await?
            .map_err(SchedulerError::from_lease)
    }
}
