//! Top-level scheduler run.
//!
//! A run refuses to start next to another orchestrator, takes the lease,
//! optionally archives yesterday's ledger, seeds today's work and then
//! drives workers through retry passes until nothing retryable is left, the
//! pass budget is spent or shutdown is requested.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use quill_ledger::{Job, Ledger};

use crate::SchedulerError;
use crate::context::SchedulerContext;
use crate::guard::InstanceGuard;
use crate::heartbeat::spawn_heartbeat;
use crate::retry::{PassManager, PassOutcome, PassStats};
use crate::rollover::{local_today, needs_rollover};
use crate::shutdown::{STOP_FILE_POLL_INTERVAL, spawn_signal_handler};
use crate::worker::{PassScope, Worker, run_pool};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// No pending or retrying jobs remain.
    AllComplete,
    /// Retryable jobs remain but every pass was used.
    MaxPassesReached,
    /// Stopped by a signal, a stop request or a lost lease.
    Interrupted,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub passes: Vec<PassStats>,
    /// Rows added by seeding at startup.
    pub seeded: usize,
    /// Archive written by a day rollover, if one happened.
    pub archived: Option<PathBuf>,
}

/// Result of `seed-only`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedSummary {
    pub archived: Option<PathBuf>,
    pub added: Vec<Job>,
}

/// Result of `stop-all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub stop_file: PathBuf,
    /// Processes that were sent SIGTERM.
    pub signalled: Vec<u32>,
}

/// Drives one scheduler process.
pub struct Orchestrator {
    ctx: Arc<SchedulerContext>,
    guard: InstanceGuard,
    handle_signals: bool,
}

impl Orchestrator {
    pub fn new(ctx: SchedulerContext) -> Self {
        let guard = InstanceGuard::new(ctx.processes.clone(), ctx.owner_pid());
        Self {
            ctx: Arc::new(ctx),
            guard,
            handle_signals: true,
        }
    }

    pub fn with_guard(mut self, guard: InstanceGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Whether Ctrl-C and SIGTERM raise shutdown. On by default.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    /// Run until the work is done, the pass budget is spent or shutdown.
    pub async fn run(&self) -> Result<RunSummary, SchedulerError> {
        let ctx = &self.ctx;
        ctx.config.validate()?;

        // Safety checks come before anything touches the ledger.
        self.guard.check(ctx.config.allow_duplicate)?;
        self.open_ledger().await?;
        ctx.lease_call(|lease| lease.acquire()).await?;

        let result = self.run_with_lease().await;

        match ctx.lease_call(|lease| lease.release()).await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not release scheduler lease"),
        }
        if let Err(e) = ctx.stop_file.clear() {
            warn!(error = %e, "could not remove stop request");
        }
        result
    }

    async fn run_with_lease(&self) -> Result<RunSummary, SchedulerError> {
        let ctx = &self.ctx;

        if ctx.stop_file.clear()? {
            info!(path = %ctx.stop_file.path().display(), "removed stale stop request");
        }
        let heartbeat = spawn_heartbeat(
            ctx.lease.clone(),
            ctx.config.heartbeat_interval,
            ctx.shutdown.clone(),
        );
        let stop_watcher = ctx
            .stop_file
            .clone()
            .spawn_watcher(ctx.shutdown.clone(), STOP_FILE_POLL_INTERVAL);
        let signals = self
            .handle_signals
            .then(|| spawn_signal_handler(ctx.shutdown.clone()));

        let result = self.run_passes().await;

        // Stop the background tasks; they all exit once shutdown is raised.
        ctx.shutdown.trigger();
        let heartbeat = heartbeat.await?;
        stop_watcher.await?;
        if let Some(signals) = signals {
            signals.await?;
        }

        let summary = result?;
        heartbeat?;
        Ok(summary)
    }

    async fn run_passes(&self) -> Result<RunSummary, SchedulerError> {
        let ctx = &self.ctx;
        let archived = if ctx.config.auto_rollover {
            self.rollover_if_stale().await?
        } else {
            None
        };
        let seeded = self.seed_from_source().await;

        let mut passes = PassManager::new(ctx.config.max_passes);
        let mut workers: Vec<Worker> = (0..ctx.config.workers)
            .map(|i| Worker::new(format!("worker-{i}"), &ctx.config))
            .collect();

        let outcome = loop {
            if ctx.shutdown.is_triggered() {
                break RunOutcome::Interrupted;
            }

            let scope = PassScope::new(passes.start_new_pass());
            let (returned, reports) = run_pool(ctx, workers, &scope).await?;
            workers = returned;
            for report in &reports {
                debug!(
                    worker_id = %report.worker_id,
                    succeeded = report.succeeded,
                    retrying = report.retrying,
                    failed = report.failed,
                    "worker pass report"
                );
            }

            let stats = ctx.ledger_call(|l| l.get_stats()).await?;
            let pass_outcome = passes.end_pass(&stats);
            if ctx.shutdown.is_triggered() {
                break RunOutcome::Interrupted;
            }
            match pass_outcome {
                PassOutcome::AllComplete => break RunOutcome::AllComplete,
                PassOutcome::MaxPassesReached => break RunOutcome::MaxPassesReached,
                PassOutcome::RetryableRemaining => {
                    info!(
                        delay_secs = ctx.config.retry_delay.as_secs(),
                        retrying = stats.retrying,
                        pending = stats.pending,
                        "waiting before next pass"
                    );
                    if !ctx.shutdown.sleep(ctx.config.retry_delay).await {
                        break RunOutcome::Interrupted;
                    }
                }
            }
        };

        Ok(RunSummary {
            outcome,
            passes: passes.into_history(),
            seeded,
            archived,
        })
    }

    async fn open_ledger(&self) -> Result<(), SchedulerError> {
        self.ctx
            .ledger_call(|l| Ledger::open(l.path(), *l.options()).map(|_| ()))
            .await
    }

    async fn rollover_if_stale(&self) -> Result<Option<PathBuf>, SchedulerError> {
        let latest = self.ctx.ledger_call(|l| l.latest_activity()).await?;
        if !needs_rollover(latest, local_today()) {
            return Ok(None);
        }
        info!(?latest, "ledger belongs to an earlier day, rolling over");
        self.archive_day().await.map(Some)
    }

    /// Seed from the job source, if there is one. A failing source is logged
    /// and the run continues with what the ledger already holds.
    async fn seed_from_source(&self) -> usize {
        let Some(source) = &self.ctx.source else {
            return 0;
        };
        let jobs = match source.source_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "job source failed, running with the existing ledger");
                return 0;
            }
        };
        let limit = self.ctx.config.daily_limit;
        match self.ctx.ledger_call(move |l| l.seed(&jobs, limit)).await {
            Ok(added) => added.len(),
            Err(e) => {
                warn!(error = %e, "seeding failed, running with the existing ledger");
                0
            }
        }
    }

    /// Archive the ledger and start a fresh one.
    ///
    /// Refused while another orchestrator is running or holds a live lease.
    pub async fn reset_day(&self) -> Result<PathBuf, SchedulerError> {
        self.guard.check(self.ctx.config.allow_duplicate)?;
        self.archive_day().await
    }

    /// The archive step of [`reset_day`](Self::reset_day), for callers that
    /// already passed the guard.
    async fn archive_day(&self) -> Result<PathBuf, SchedulerError> {
        let archive_dir = self.ctx.config.archive_dir.clone();
        let lease = self.ctx.lease.clone();
        self.ctx
            .ledger_call(move |l| l.reset_day(&archive_dir, &lease))
            .await
            .map_err(|e| match e {
                SchedulerError::Ledger(inner) => SchedulerError::from_lease(inner),
                other => other,
            })
    }

    /// Seed without running workers.
    ///
    /// `fresh` discards today's ledger and is only honoured together with
    /// `reset_day`, which archives it first and is subject to the same
    /// guard and lease checks as [`reset_day`](Self::reset_day).
    pub async fn seed_only(&self, fresh: bool, reset_day: bool) -> Result<SeedSummary, SchedulerError> {
        if fresh && !reset_day {
            return Err(SchedulerError::UnsafeReseed);
        }
        if reset_day {
            self.guard.check(self.ctx.config.allow_duplicate)?;
        }
        let source = self.ctx.source.clone().ok_or_else(|| {
            SchedulerError::Collaborator("no job source configured for seeding".into())
        })?;

        self.open_ledger().await?;
        let archived = if reset_day {
            Some(self.archive_day().await?)
        } else {
            None
        };

        let jobs = source.source_jobs().await?;
        let limit = self.ctx.config.daily_limit;
        let added = self.ctx.ledger_call(move |l| l.seed(&jobs, limit)).await?;
        Ok(SeedSummary { archived, added })
    }

    /// Ask every running orchestrator to stop.
    ///
    /// Drops a stop request next to the ledger, then sends SIGTERM to the
    /// live lease owner and to any process matching the guard's signature.
    pub fn stop_all(&self) -> Result<StopReport, SchedulerError> {
        let ctx = &self.ctx;
        ctx.stop_file.request()?;
        info!(path = %ctx.stop_file.path().display(), "stop requested");

        let mut signalled = Vec::new();
        let mut signal = |pid: u32| {
            if pid == ctx.owner_pid() || signalled.contains(&pid) {
                return;
            }
            if ctx.processes.terminate(pid) {
                info!(pid, "sent SIGTERM");
                signalled.push(pid);
            } else {
                warn!(pid, "could not signal process");
            }
        };

        if let Some(lease) = ctx.lease.read()?
            && ctx.lease.is_live(&lease, chrono::Utc::now())
        {
            signal(lease.owner_pid);
        }
        for peer in self.guard.find_peers() {
            signal(peer.pid);
        }

        Ok(StopReport {
            stop_file: ctx.stop_file.path().to_path_buf(),
            signalled,
        })
    }
}
