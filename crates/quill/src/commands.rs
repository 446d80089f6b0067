//! Subcommand implementations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tracing::{error, info};

use quill_ledger::{LeaseFile, Ledger};
use quill_scheduler::{
    CommandBackend, FileJobSource, Orchestrator, SchedulerConfig, SchedulerContext,
    SchedulerError, StatusReport,
};

use crate::{QuotaArgs, RunArgs};

/// Ledger location shared by every subcommand.
pub struct Paths {
    pub ledger: PathBuf,
    pub archive_dir: Option<PathBuf>,
}

impl Paths {
    fn config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::new(&self.ledger);
        if let Some(dir) = &self.archive_dir {
            config.archive_dir = dir.clone();
        }
        config
    }
}

/// Turn a scheduler error into the CLI's error report.
fn report(err: SchedulerError) -> miette::Report {
    if err.is_safety_failure() {
        error!("refusing to continue: {err}");
    }
    miette::miette!("{err}")
}

/// Context for subcommands that never execute jobs. Its backend refuses
/// anything it is asked to run.
fn control_context(config: SchedulerConfig) -> SchedulerContext {
    let backend = Arc::new(CommandBackend::new("false"));
    SchedulerContext::new(config, backend.clone(), backend)
}

pub async fn run(paths: &Paths, args: RunArgs) -> Result<()> {
    let mut config = paths.config();
    config.workers = args.workers;
    config.daily_limit = args.quota.daily_limit;
    config.max_attempts = args.quota.max_attempts;
    config.max_passes = args.max_passes;
    config.retry_delay = Duration::from_secs(args.retry_delay);
    config.retry_min_delay = Duration::from_secs(args.retry_min_delay.unwrap_or(args.retry_delay));
    config.infra_retry_limit = args.infra_retry_limit;
    config.retry_unknown = args.retry_unknown;
    config.auto_rollover = args.auto_rollover;
    config.allow_duplicate = args.allow_duplicate;

    let backend = Arc::new(
        CommandBackend::new(args.execute_cmd)
            .with_health_cmd(args.health_cmd)
            .with_restart_cmd(args.restart_cmd)
            .with_execute_timeout(Duration::from_secs(args.execute_timeout)),
    );
    let mut ctx = SchedulerContext::new(config, backend.clone(), backend);
    if let Some(jobs_file) = args.jobs_file {
        ctx = ctx.with_source(Arc::new(FileJobSource::new(jobs_file)));
    }

    info!(
        ledger = %paths.ledger.display(),
        workers = ctx.config.workers,
        daily_limit = ctx.config.daily_limit,
        max_passes = ctx.config.max_passes,
        "starting scheduler"
    );
    let summary = Orchestrator::new(ctx).run().await.map_err(report)?;

    if let Some(archive) = &summary.archived {
        info!(archive = %archive.display(), "rolled over to a new day");
    }
    let last = summary.passes.last();
    info!(
        outcome = ?summary.outcome,
        passes = summary.passes.len(),
        seeded = summary.seeded,
        succeeded = last.map_or(0, |p| p.succeeded),
        retrying = last.map_or(0, |p| p.retrying),
        failed_account = last.map_or(0, |p| p.failed_account),
        failed_infrastructure = last.map_or(0, |p| p.failed_infrastructure),
        failed_unknown = last.map_or(0, |p| p.failed_unknown),
        "run finished"
    );
    Ok(())
}

pub fn status(paths: &Paths, json: bool) -> Result<()> {
    let config = paths.config();
    let ledger = Ledger::new(&config.ledger_path, config.ledger_options());
    let lease = LeaseFile::for_ledger(&config.ledger_path).with_stale_threshold(config.stale_threshold);

    let status = StatusReport::collect(&ledger, &lease).map_err(report)?;
    if json {
        println!("{}", status.to_json().map_err(report)?);
    } else {
        print!("{}", status.render_text());
    }
    Ok(())
}

pub async fn reset_day(paths: &Paths) -> Result<()> {
    let orchestrator = Orchestrator::new(control_context(paths.config()));
    let archive = orchestrator.reset_day().await.map_err(report)?;
    println!("archived {} to {}", paths.ledger.display(), archive.display());
    Ok(())
}

pub async fn seed_only(
    paths: &Paths,
    jobs_file: PathBuf,
    quota: QuotaArgs,
    fresh: bool,
    reset_day: bool,
) -> Result<()> {
    let mut config = paths.config();
    config.daily_limit = quota.daily_limit;
    config.max_attempts = quota.max_attempts;
    let ctx = control_context(config).with_source(Arc::new(FileJobSource::new(jobs_file)));

    let seeded = Orchestrator::new(ctx)
        .seed_only(fresh, reset_day)
        .await
        .map_err(report)?;
    if let Some(archive) = &seeded.archived {
        println!("archived previous ledger to {}", archive.display());
    }
    println!("seeded {} job(s)", seeded.added.len());
    for job in &seeded.added {
        println!("  {}\t{}\t{}", job.job_id, job.account, job.payload_ref);
    }
    Ok(())
}

pub fn stop_all(paths: &Paths) -> Result<()> {
    let stopped = Orchestrator::new(control_context(paths.config()))
        .stop_all()
        .map_err(report)?;
    println!("stop requested via {}", stopped.stop_file.display());
    if stopped.signalled.is_empty() {
        println!("no running orchestrator found");
    } else {
        for pid in &stopped.signalled {
            println!("sent SIGTERM to pid {pid}");
        }
    }
    Ok(())
}
