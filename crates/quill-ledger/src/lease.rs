//! Leadership lease: at most one live scheduler per ledger.
//!
//! The lease is a small JSON file next to the ledger. It is *live* while its
//! owner process exists and its heartbeat is younger than the stale
//! threshold; anything else may be taken over. Reads and writes of the lease
//! happen under a dedicated advisory lock so two starting schedulers cannot
//! both decide the lease is free.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::LedgerError;
use crate::process::{ProcessTable, SystemProcessTable};
use crate::storage::{FileLock, sibling, write_atomic};

/// Default heartbeat age after which a lease is considered stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(120);

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// The persisted lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner_pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Lease {
    fn new(owner_pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            owner_pid,
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// Time since the last heartbeat. A heartbeat in the future counts as zero.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }
}

/// Handle on a lease file for one would-be owner.
#[derive(Clone)]
pub struct LeaseFile {
    path: PathBuf,
    stale_threshold: Duration,
    processes: Arc<dyn ProcessTable>,
    owner_pid: u32,
}

impl std::fmt::Debug for LeaseFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseFile")
            .field("path", &self.path)
            .field("stale_threshold", &self.stale_threshold)
            .field("owner_pid", &self.owner_pid)
            .finish_non_exhaustive()
    }
}

impl LeaseFile {
    /// A lease at `path`, owned (once acquired) by the current process.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            processes: Arc::new(SystemProcessTable),
            owner_pid: std::process::id(),
        }
    }

    /// The lease that guards `ledger_path`: `<ledger>.lease.json`.
    pub fn for_ledger(ledger_path: &Path) -> Self {
        Self::new(sibling(ledger_path, ".lease.json"))
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_process_table(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.processes = processes;
        self
    }

    /// Act on behalf of `pid` instead of the current process.
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Read the current lease without locking. A missing or unreadable file
    /// means no lease.
    pub fn read(&self) -> Result<Option<Lease>, LedgerError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(lease) => Ok(Some(lease)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable lease file");
                Ok(None)
            }
        }
    }

    /// Owner process alive and heartbeat fresh.
    pub fn is_live(&self, lease: &Lease, now: DateTime<Utc>) -> bool {
        lease.heartbeat_age(now) < self.stale_threshold && self.processes.is_alive(lease.owner_pid)
    }

    /// A live lease held by some other process, if there is one.
    pub fn live_foreign_lease(&self, now: DateTime<Utc>) -> Result<Option<Lease>, LedgerError> {
        Ok(self
            .read()?
            .filter(|lease| lease.owner_pid != self.owner_pid && self.is_live(lease, now)))
    }

    fn lock(&self) -> Result<FileLock, LedgerError> {
        FileLock::acquire(&sibling(&self.path, ".lock"), LOCK_TIMEOUT, LOCK_RETRY_INTERVAL)
    }

    /// Run `f` under the lease lock, refusing with [`LedgerError::LeaseHeld`]
    /// if another process holds a live lease. No one can acquire the lease
    /// until `f` returns.
    pub fn while_unheld<T>(
        &self,
        f: impl FnOnce() -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let _lock = self.lock()?;
        if let Some(held) = self.live_foreign_lease(Utc::now())? {
            return Err(LedgerError::LeaseHeld {
                pid: held.owner_pid,
            });
        }
        f()
    }

    /// Take the lease.
    ///
    /// Re-acquiring a lease this owner already holds refreshes it. A live
    /// lease held by another process is refused with
    /// [`LedgerError::LeaseHeld`]; a stale or orphaned one is taken over.
    pub fn acquire(&self) -> Result<Lease, LedgerError> {
        let _lock = self.lock()?;
        let now = Utc::now();

        let lease = match self.read()? {
            Some(existing) if existing.owner_pid == self.owner_pid => {
                debug!(pid = self.owner_pid, "lease already held by this process");
                Lease {
                    last_heartbeat: now,
                    ..existing
                }
            }
            Some(existing) if self.is_live(&existing, now) => {
                return Err(LedgerError::LeaseHeld {
                    pid: existing.owner_pid,
                });
            }
            Some(existing) => {
                warn!(
                    previous_pid = existing.owner_pid,
                    heartbeat_age_secs = existing.heartbeat_age(now).as_secs(),
                    owner_alive = self.processes.is_alive(existing.owner_pid),
                    new_pid = self.owner_pid,
                    "taking over stale scheduler lease"
                );
                Lease::new(self.owner_pid, now)
            }
            None => Lease::new(self.owner_pid, now),
        };

        self.write(&lease)?;
        info!(pid = lease.owner_pid, path = %self.path.display(), "scheduler lease acquired");
        Ok(lease)
    }

    /// Refresh `last_heartbeat`. Returns `false` without writing when the
    /// lease no longer belongs to this owner.
    pub fn heartbeat(&self) -> Result<bool, LedgerError> {
        let _lock = self.lock()?;
        match self.read()? {
            Some(mut lease) if lease.owner_pid == self.owner_pid => {
                lease.last_heartbeat = Utc::now();
                self.write(&lease)?;
                debug!(pid = self.owner_pid, "lease heartbeat");
                Ok(true)
            }
            Some(lease) => {
                warn!(
                    pid = self.owner_pid,
                    current_owner = lease.owner_pid,
                    "lease now belongs to another process"
                );
                Ok(false)
            }
            None => {
                warn!(pid = self.owner_pid, "lease file disappeared");
                Ok(false)
            }
        }
    }

    /// Remove the lease file if this owner still holds it.
    pub fn release(&self) -> Result<bool, LedgerError> {
        let _lock = self.lock()?;
        match self.read()? {
            Some(lease) if lease.owner_pid == self.owner_pid => {
                std::fs::remove_file(&self.path)?;
                info!(pid = self.owner_pid, "scheduler lease released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn write(&self, lease: &Lease) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(lease)?;
        write_atomic(&self.path, json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::FakeProcessTable;

    fn lease_file(dir: &Path, processes: &FakeProcessTable, pid: u32) -> LeaseFile {
        LeaseFile::new(dir.join("progress.tsv.lease.json"))
            .with_process_table(Arc::new(processes.clone()))
            .with_owner_pid(pid)
    }

    fn write_lease(file: &LeaseFile, lease: &Lease) {
        std::fs::write(file.path(), serde_json::to_string(lease).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        let file = lease_file(dir.path(), &procs, 100);

        let lease = file.acquire().unwrap();
        assert_eq!(lease.owner_pid, 100);
        assert_eq!(file.read().unwrap(), Some(lease));
    }

    #[test]
    fn test_live_lease_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        procs.spawn(100, "quill run");
        lease_file(dir.path(), &procs, 100).acquire().unwrap();

        let err = lease_file(dir.path(), &procs, 200).acquire().unwrap_err();
        assert!(matches!(err, LedgerError::LeaseHeld { pid: 100 }));
    }

    #[test]
    fn test_dead_owner_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        lease_file(dir.path(), &procs, 100).acquire().unwrap();

        // pid 100 was never registered as running
        let lease = lease_file(dir.path(), &procs, 200).acquire().unwrap();
        assert_eq!(lease.owner_pid, 200);
    }

    #[test]
    fn test_stale_heartbeat_is_taken_over_even_if_alive() {
        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        procs.spawn(100, "quill run");
        let file = lease_file(dir.path(), &procs, 200);
        let old = Utc::now() - chrono::Duration::minutes(10);
        write_lease(
            &file,
            &Lease {
                owner_pid: 100,
                started_at: old,
                last_heartbeat: old,
            },
        );

        assert_eq!(file.acquire().unwrap().owner_pid, 200);
    }

    #[test]
    fn test_reacquire_by_same_owner_keeps_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        procs.spawn(100, "quill run");
        let file = lease_file(dir.path(), &procs, 100);

        let first = file.acquire().unwrap();
        let second = file.acquire().unwrap();
        assert_eq!(first.started_at, second.started_at);
        assert!(second.last_heartbeat >= first.last_heartbeat);
    }

    #[test]
    fn test_heartbeat_only_for_owner() {
        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        let mine = lease_file(dir.path(), &procs, 100);
        let theirs = lease_file(dir.path(), &procs, 200);

        mine.acquire().unwrap();
        assert!(mine.heartbeat().unwrap());
        assert!(!theirs.heartbeat().unwrap());

        // Owner died, someone else took over: our heartbeat must notice.
        theirs.acquire().unwrap();
        assert!(!mine.heartbeat().unwrap());
        assert_eq!(mine.read().unwrap().unwrap().owner_pid, 200);
    }

    #[test]
    fn test_release_only_removes_own_lease() {
        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        let mine = lease_file(dir.path(), &procs, 100);
        let theirs = lease_file(dir.path(), &procs, 200);

        mine.acquire().unwrap();
        assert!(!theirs.release().unwrap());
        assert!(mine.path().exists());
        assert!(mine.release().unwrap());
        assert!(!mine.path().exists());
        assert!(!mine.release().unwrap());
    }

    #[test]
    fn test_corrupt_lease_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        let file = lease_file(dir.path(), &procs, 100);
        std::fs::write(file.path(), "{not json").unwrap();

        assert_eq!(file.read().unwrap(), None);
        assert_eq!(file.acquire().unwrap().owner_pid, 100);
    }

    #[test]
    fn test_live_foreign_lease_ignores_self() {
        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        procs.spawn(100, "quill run");
        let mine = lease_file(dir.path(), &procs, 100);
        mine.acquire().unwrap();

        let now = Utc::now();
        assert!(mine.live_foreign_lease(now).unwrap().is_none());
        let other = lease_file(dir.path(), &procs, 200);
        assert_eq!(other.live_foreign_lease(now).unwrap().unwrap().owner_pid, 100);
    }

    #[test]
    fn test_while_unheld_refuses_live_lease() {
        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        procs.spawn(100, "quill run");
        lease_file(dir.path(), &procs, 100).acquire().unwrap();

        let mut ran = false;
        let err = lease_file(dir.path(), &procs, 200)
            .while_unheld(|| {
                ran = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::LeaseHeld { pid: 100 }));
        assert!(!ran);
    }

    #[test]
    fn test_acquire_waits_for_while_unheld() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::mpsc;

        let dir = tempfile::tempdir().unwrap();
        let procs = FakeProcessTable::new();
        let archiver = lease_file(dir.path(), &procs, 100);
        let scheduler = lease_file(dir.path(), &procs, 200);
        let finished = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = mpsc::channel();

        let holder = {
            let finished = finished.clone();
            std::thread::spawn(move || {
                archiver
                    .while_unheld(|| {
                        entered_tx.send(()).unwrap();
                        std::thread::sleep(Duration::from_millis(200));
                        finished.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
            })
        };

        entered_rx.recv().unwrap();
        scheduler.acquire().unwrap();
        assert!(finished.load(Ordering::SeqCst));
        holder.join().unwrap();
    }
}
