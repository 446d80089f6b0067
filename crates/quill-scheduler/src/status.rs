//! Operator status report.

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use quill_ledger::{JobStatus, Ledger, LeaseFile, LedgerStats};

use crate::SchedulerError;

/// The scheduler lease as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseStatus {
    pub owner_pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_age_secs: u64,
    /// Owner alive and heartbeat fresh.
    pub live: bool,
}

/// Everything `quill status` shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub ledger: PathBuf,
    pub generated_at: DateTime<Utc>,
    pub stats: LedgerStats,
    pub lease: Option<LeaseStatus>,
}

impl StatusReport {
    pub fn collect(ledger: &Ledger, lease: &LeaseFile) -> Result<Self, SchedulerError> {
        let stats = ledger.get_stats()?;
        let now = Utc::now();
        let lease = lease.read()?.map(|held| LeaseStatus {
            owner_pid: held.owner_pid,
            started_at: held.started_at,
            last_heartbeat: held.last_heartbeat,
            heartbeat_age_secs: held.heartbeat_age(now).as_secs(),
            live: lease.is_live(&held, now),
        });
        Ok(Self {
            ledger: ledger.path().to_path_buf(),
            generated_at: now,
            stats,
            lease,
        })
    }

    pub fn to_json(&self) -> Result<String, SchedulerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render_text(&self) -> String {
        let stats = &self.stats;
        let mut out = String::new();
        let _ = writeln!(out, "Ledger: {}", self.ledger.display());
        let _ = writeln!(out, "Jobs: {} total", stats.total);
        for status in JobStatus::ALL {
            let _ = writeln!(out, "  {:<10} {}", status.as_str(), stats.count(status));
        }

        let _ = writeln!(out, "Failures by category:");
        for (name, count) in [
            ("account", stats.failed_account),
            ("infrastructure", stats.failed_infrastructure),
            ("unknown", stats.failed_unknown),
        ] {
            let _ = writeln!(out, "  {name:<16} {count}");
        }

        if stats.accounts_on_cooldown.is_empty() {
            let _ = writeln!(out, "Accounts on cooldown: none");
        } else {
            let _ = writeln!(out, "Accounts on cooldown:");
            for cooldown in &stats.accounts_on_cooldown {
                let left = (cooldown.until - self.generated_at).num_minutes().max(0);
                let _ = writeln!(
                    out,
                    "  {} until {} ({}m left, {} consecutive infrastructure failures)",
                    cooldown.account,
                    cooldown.until.format("%H:%M:%S UTC"),
                    left,
                    cooldown.consecutive_infra_failures
                );
            }
        }

        match &self.lease {
            Some(lease) => {
                let _ = writeln!(
                    out,
                    "Lease: pid {} ({}), heartbeat {}s ago",
                    lease.owner_pid,
                    if lease.live { "live" } else { "stale" },
                    lease.heartbeat_age_secs
                );
            }
            None => {
                let _ = writeln!(out, "Lease: not held");
            }
        }
        out
    }
}
