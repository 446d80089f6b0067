//! Lease heartbeat.

use std::time::Duration;

use quill_ledger::LeaseFile;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::SchedulerError;
use crate::shutdown::Shutdown;

/// Refresh the lease every `interval` until shutdown.
///
/// If the lease turns out to belong to someone else the task raises
/// `shutdown` and finishes with [`SchedulerError::LeaseLost`]. Transient IO
/// failures are logged and retried on the next tick.
pub fn spawn_heartbeat(
    lease: LeaseFile,
    interval: Duration,
    shutdown: Shutdown,
) -> JoinHandle<Result<(), SchedulerError>> {
    tokio::spawn(async move {
        while shutdown.sleep(interval).await {
            let lease = lease.clone();
            match tokio::task::spawn_blocking(move || lease.heartbeat()).await? {
                Ok(true) => {}
                Ok(false) => {
                    error!("scheduler lease lost, shutting down");
                    shutdown.trigger();
                    return Err(SchedulerError::LeaseLost);
                }
                Err(e) => warn!(error = %e, "lease heartbeat failed"),
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quill_ledger::FakeProcessTable;

    use super::*;

    fn lease(dir: &std::path::Path, pid: u32, processes: &FakeProcessTable) -> LeaseFile {
        LeaseFile::new(dir.join("progress.tsv.lease.json"))
            .with_process_table(Arc::new(processes.clone()))
            .with_owner_pid(pid)
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcessTable::new();
        processes.spawn(10, "quill run");
        let lease = lease(dir.path(), 10, &processes);
        let first = lease.acquire().unwrap();

        let shutdown = Shutdown::new();
        let task = spawn_heartbeat(lease.clone(), Duration::from_millis(20), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown.trigger();
        task.await.unwrap().unwrap();

        let refreshed = lease.read().unwrap().unwrap();
        assert_eq!(refreshed.owner_pid, 10);
        assert!(refreshed.last_heartbeat > first.last_heartbeat);
    }

    #[tokio::test]
    async fn test_lost_lease_raises_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcessTable::new();
        let ours = lease(dir.path(), 10, &processes);
        ours.acquire().unwrap();

        // Owner 10 is not in the process table, so 20 takes the lease over.
        processes.spawn(20, "quill run");
        lease(dir.path(), 20, &processes)
            .with_stale_threshold(Duration::ZERO)
            .acquire()
            .unwrap();

        let shutdown = Shutdown::new();
        let task = spawn_heartbeat(ours, Duration::from_millis(10), shutdown.clone());
        let result = task.await.unwrap();
        assert!(matches!(result, Err(SchedulerError::LeaseLost)));
        assert!(shutdown.is_triggered());
    }
}
