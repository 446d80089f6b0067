//! Worker loop.
//!
//! Each worker repeats health check, claim, execute and report until the
//! pass has nothing claimable left or shutdown is raised. Job failures are
//! recorded in the ledger and never end the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tracing::{debug, error, info, warn};

use quill_ledger::classify::{self, Classification};
use quill_ledger::{ErrorCategory, Job, JobStatus, JobUpdate};

use crate::SchedulerError;
use crate::backend::ExecutionResult;
use crate::config::SchedulerConfig;
use crate::context::SchedulerContext;

/// Times an outcome report is retried after a transient ledger error.
const REPORT_RETRIES: u32 = 3;

/// Ceiling for the restart backoff, as a multiple of the configured backoff.
const RESTART_BACKOFF_CEILING: u32 = 10;

/// Pass-scoped bookkeeping shared by the workers of one process.
///
/// A worker that finds nothing to claim keeps waiting while a sibling is
/// still working a job, since finishing it can unblock the account's next
/// pending row.
#[derive(Debug, Clone)]
pub struct PassScope {
    number: u32,
    busy: Arc<AtomicUsize>,
}

impl PassScope {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Workers currently claiming or executing.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    fn enter(&self) -> BusyGuard {
        self.busy.fetch_add(1, Ordering::SeqCst);
        BusyGuard {
            busy: self.busy.clone(),
        }
    }
}

struct BusyGuard {
    busy: Arc<AtomicUsize>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What one worker did during one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: String,
    pub succeeded: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Outcome reports the ledger refused (job vanished or moved on).
    pub rejected: usize,
}

impl WorkerReport {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            ..Self::default()
        }
    }

    pub fn executed(&self) -> usize {
        self.succeeded + self.retrying + self.failed + self.rejected
    }

    fn record(&mut self, status: Option<JobStatus>) {
        match status {
            Some(JobStatus::Success) => self.succeeded += 1,
            Some(JobStatus::Retrying) => self.retrying += 1,
            Some(_) => self.failed += 1,
            None => self.rejected += 1,
        }
    }
}

/// One worker and its private backend-health state.
#[derive(Debug)]
pub struct Worker {
    id: String,
    health_failures: u32,
    restart_backoff: ExponentialBackoff,
}

impl Worker {
    pub fn new(id: impl Into<String>, config: &SchedulerConfig) -> Self {
        let mut restart_backoff = ExponentialBackoff {
            initial_interval: config.restart_backoff,
            max_interval: config.restart_backoff * RESTART_BACKOFF_CEILING,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        restart_backoff.reset();
        Self {
            id: id.into(),
            health_failures: 0,
            restart_backoff,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Consecutive failed health checks.
    pub fn health_failures(&self) -> u32 {
        self.health_failures
    }

    /// Work until the pass has nothing claimable left or shutdown is raised.
    pub async fn run_pass(
        &mut self,
        ctx: &SchedulerContext,
        pass: &PassScope,
    ) -> Result<WorkerReport, SchedulerError> {
        let mut report = WorkerReport::new(&self.id);
        debug!(worker_id = %self.id, pass = pass.number(), "worker entering pass");

        while !ctx.shutdown.is_triggered() {
            if !self.ensure_healthy(ctx).await {
                continue;
            }

            let busy = pass.enter();
            let claimed = match self.claim(ctx).await {
                Ok(claimed) => claimed,
                Err(e) if e.is_transient() => {
                    warn!(worker_id = %self.id, error = %e, "claim failed, will retry");
                    drop(busy);
                    ctx.shutdown.sleep(ctx.config.idle_sleep).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(job) = claimed else {
                drop(busy);
                if pass.busy() == 0 {
                    debug!(worker_id = %self.id, pass = pass.number(), "nothing left to claim");
                    break;
                }
                ctx.shutdown.sleep(ctx.config.idle_sleep).await;
                continue;
            };

            let status = self.execute(ctx, job, pass.number()).await?;
            report.record(status);
            drop(busy);
        }

        debug!(worker_id = %self.id, executed = report.executed(), "worker leaving pass");
        Ok(report)
    }

    /// Probe the backend, restarting it after repeated failures.
    ///
    /// Returns `true` when the worker may claim a job.
    async fn ensure_healthy(&mut self, ctx: &SchedulerContext) -> bool {
        if ctx.health.health_check(&self.id).await {
            if self.health_failures > 0 {
                info!(worker_id = %self.id, "backend healthy again");
            }
            self.health_failures = 0;
            self.restart_backoff.reset();
            return true;
        }

        self.health_failures += 1;
        warn!(
            worker_id = %self.id,
            consecutive_failures = self.health_failures,
            "backend health check failed"
        );
        if self.health_failures < ctx.config.health_failure_threshold {
            ctx.shutdown.sleep(ctx.config.idle_sleep).await;
            return false;
        }

        warn!(worker_id = %self.id, "restarting backend");
        if ctx.health.restart(&self.id).await {
            info!(worker_id = %self.id, "backend restarted");
            self.health_failures = 0;
            return false;
        }

        let wait = self
            .restart_backoff
            .next_backoff()
            .unwrap_or(ctx.config.restart_backoff);
        error!(
            worker_id = %self.id,
            wait_secs = wait.as_secs(),
            "backend restart failed, backing off"
        );
        ctx.shutdown.sleep(wait).await;
        false
    }

    /// A pending job, else the first ready retry that can still be claimed.
    async fn claim(&self, ctx: &SchedulerContext) -> Result<Option<Job>, SchedulerError> {
        let limit = ctx.config.daily_limit;

        let worker_id = self.id.clone();
        if let Some(job) = ctx
            .ledger_call(move |l| l.claim_next_job(&worker_id, limit))
            .await?
        {
            return Ok(Some(job));
        }

        let min_delay = ctx.config.retry_min_delay;
        let ready = ctx.ledger_call(move |l| l.get_retry_jobs(min_delay)).await?;
        for candidate in ready {
            let worker_id = self.id.clone();
            if let Some(job) = ctx
                .ledger_call(move |l| l.claim_retry_job(&candidate.job_id, &worker_id, limit))
                .await?
            {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Run one claimed job and record its outcome.
    ///
    /// Returns the recorded status, or `None` if the ledger refused the report.
    async fn execute(
        &self,
        ctx: &SchedulerContext,
        job: Job,
        pass: u32,
    ) -> Result<Option<JobStatus>, SchedulerError> {
        info!(
            worker_id = %self.id,
            job_id = %job.job_id,
            account = %job.account,
            attempts = job.attempts,
            "executing job"
        );
        let result = ctx.executor.execute(&self.id, &job).await;
        let update = outcome_update(&job, &result, &self.id, pass, &ctx.config);

        match update.status {
            JobStatus::Success => info!(job_id = %job.job_id, account = %job.account, "job succeeded"),
            JobStatus::Retrying => warn!(
                job_id = %job.job_id,
                account = %job.account,
                category = ?update.category,
                error = %result.error,
                "job failed, will retry"
            ),
            _ => error!(
                job_id = %job.job_id,
                account = %job.account,
                category = ?update.category,
                error = %result.error,
                "job failed permanently"
            ),
        }

        self.report(ctx, update).await
    }

    async fn report(
        &self,
        ctx: &SchedulerContext,
        update: JobUpdate,
    ) -> Result<Option<JobStatus>, SchedulerError> {
        let mut retries = 0;
        loop {
            let attempt = update.clone();
            match ctx
                .ledger_call(move |l| l.update_job_status(&attempt))
                .await
            {
                Ok(true) => return Ok(Some(update.status)),
                Ok(false) => {
                    warn!(worker_id = %self.id, job_id = %update.job_id, "ledger refused outcome report");
                    return Ok(None);
                }
                Err(e) if e.is_transient() && retries < REPORT_RETRIES => {
                    retries += 1;
                    warn!(worker_id = %self.id, job_id = %update.job_id, error = %e, retries, "outcome report failed, retrying");
                    // Not interruptible: the outcome must land even during shutdown.
                    tokio::time::sleep(ctx.config.idle_sleep).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Decide how an execution result is recorded.
///
/// Account failures are final. Infrastructure failures retry while
/// `attempts` is below the smaller of the job's `max_attempts` and the
/// infrastructure retry limit; unknown failures retry while below
/// `max_attempts`, unless disabled.
pub fn outcome_update(
    job: &Job,
    result: &ExecutionResult,
    worker_id: &str,
    pass: u32,
    config: &SchedulerConfig,
) -> JobUpdate {
    if result.success {
        return JobUpdate::success(&job.job_id, worker_id).in_pass(pass);
    }

    let error_type = Some(result.error_type.as_str()).filter(|t| !t.is_empty());
    let Classification {
        category,
        error_type,
    } = classify::resolve(result.category, error_type, &result.error);

    let retry = match category {
        ErrorCategory::Account => false,
        ErrorCategory::Infrastructure => job.attempts < config.infra_cap(job.max_attempts),
        ErrorCategory::Unknown => config.retry_unknown && job.attempts < job.max_attempts,
    };
    let status = if retry {
        JobStatus::Retrying
    } else {
        JobStatus::Failed
    };

    JobUpdate::failure(&job.job_id, worker_id, status, &result.error)
        .classified(Some(category), &error_type)
        .in_pass(pass)
}

/// Run every worker through one pass concurrently.
///
/// Workers are handed back so health state carries into the next pass. The
/// first worker error is returned after all workers have stopped.
pub async fn run_pool(
    ctx: &Arc<SchedulerContext>,
    workers: Vec<Worker>,
    pass: &PassScope,
) -> Result<(Vec<Worker>, Vec<WorkerReport>), SchedulerError> {
    let mut handles = Vec::with_capacity(workers.len());
    for mut worker in workers {
        let ctx = ctx.clone();
        let pass = pass.clone();
        handles.push(tokio::spawn(async move {
            let result = worker.run_pass(&ctx, &pass).await;
            if let Err(e) = &result {
                error!(worker_id = %worker.id, error = %e, "worker stopped");
                // One worker hitting a fatal ledger error stops the rest.
                ctx.shutdown.trigger();
            }
            (worker, result)
        }));
    }

    let mut workers = Vec::with_capacity(handles.len());
    let mut reports = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        let (worker, result) = handle.await?;
        workers.push(worker);
        match result {
            Ok(report) => reports.push(report),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok((workers, reports)),
    }
}
