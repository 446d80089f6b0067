//! Cooperative shutdown.
//!
//! One [`Shutdown`] is shared by the orchestrator, workers, the heartbeat
//! and signal watchers. Nothing is cancelled forcibly: loops check the flag
//! between iterations and sleeps wake up early when it is raised.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How often the stop-request file is polled.
pub const STOP_FILE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A clonable shutdown flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Raise the flag. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is raised.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so `wait_for` cannot fail with a closed channel here.
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration` unless shutdown is raised first.
    ///
    /// Returns `true` if the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = self.triggered() => false,
            _ = tokio::time::sleep(duration) => !self.is_triggered(),
        }
    }
}

/// Raise `shutdown` on Ctrl-C or SIGTERM.
pub fn spawn_signal_handler(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received interrupt, shutting down"),
            _ = terminate_signal() => info!("received SIGTERM, shutting down"),
            _ = shutdown.triggered() => return,
        }
        shutdown.trigger();
    })
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "could not install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// The stop-request file that `stop-all` drops next to a ledger.
#[derive(Debug, Clone)]
pub struct StopFile {
    path: PathBuf,
}

impl StopFile {
    pub fn for_ledger(ledger_path: &Path) -> Self {
        Self {
            path: quill_ledger::storage::sibling(ledger_path, ".stop"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_requested(&self) -> bool {
        self.path.exists()
    }

    /// Record a stop request.
    pub fn request(&self) -> std::io::Result<()> {
        let body = serde_json::json!({
            "requested_at": Utc::now(),
            "requested_by": std::process::id(),
        });
        std::fs::write(&self.path, format!("{body}\n"))
    }

    /// Remove the request. Returns whether one existed.
    pub fn clear(&self) -> std::io::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Poll for a stop request and raise `shutdown` when one appears.
    pub fn spawn_watcher(self, shutdown: Shutdown, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_requested() {
                    info!(path = %self.path.display(), "stop requested, shutting down");
                    shutdown.trigger();
                    return;
                }
                if !shutdown.sleep(interval).await {
                    return;
                }
            }
        })
    }
}
