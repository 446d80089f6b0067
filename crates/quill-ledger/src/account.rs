//! Per-account failure counters and cooldown windows.
//!
//! Kept in a JSON side file next to the ledger and only mutated while the
//! ledger lock is held, so every worker process sees the same cooldowns.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::LedgerError;
use crate::storage::write_atomic;

/// Current on-disk format version.
const STATE_VERSION: u32 = 1;

/// When infrastructure failures put an account on cooldown, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    /// Consecutive infrastructure failures before the first cooldown.
    pub threshold: u32,
    /// Cooldown applied when the threshold is first reached.
    pub base: Duration,
    /// Upper bound for a single cooldown.
    pub max: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            base: Duration::minutes(5),
            max: Duration::hours(1),
        }
    }
}

impl CooldownPolicy {
    /// Cooldown for an account with `failures` consecutive infrastructure
    /// failures, or `None` below the threshold.
    ///
    /// Doubles for every failure past the threshold: 5m, 10m, 20m, 40m, 1h.
    pub fn backoff(&self, failures: u32) -> Option<Duration> {
        if failures < self.threshold.max(1) {
            return None;
        }
        let exponent = (failures - self.threshold.max(1)).min(16);
        let scaled = self.base * (1i32 << exponent);
        Some(scaled.min(self.max))
    }
}

/// Tracked state for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    #[serde(default)]
    pub consecutive_infra_failures: u32,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// An account that is currently excluded from new assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cooldown {
    pub account: String,
    pub until: DateTime<Utc>,
    pub consecutive_infra_failures: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AccountStateFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    accounts: BTreeMap<String, AccountState>,
}

/// Cooldown map keyed by account name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountStates {
    accounts: BTreeMap<String, AccountState>,
}

impl AccountStates {
    /// Load from `path`; a missing file means no account has any state yet.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: AccountStateFile = serde_json::from_str(&raw)?;
        Ok(Self {
            accounts: file.accounts,
        })
    }

    /// Persist to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let file = AccountStateFile {
            version: STATE_VERSION,
            accounts: self.accounts.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        write_atomic(path, json.as_bytes())
    }

    /// State for `account` (default if never seen).
    pub fn get(&self, account: &str) -> AccountState {
        self.accounts.get(account).cloned().unwrap_or_default()
    }

    /// Whether `account` is excluded from new assignments at `now`.
    pub fn is_on_cooldown(&self, account: &str, now: DateTime<Utc>) -> bool {
        self.accounts
            .get(account)
            .and_then(|s| s.cooldown_until)
            .is_some_and(|until| until > now)
    }

    /// Record an infrastructure failure. Returns the new cooldown end when
    /// this failure starts (or extends) a cooldown.
    pub fn record_infra_failure(
        &mut self,
        account: &str,
        now: DateTime<Utc>,
        policy: &CooldownPolicy,
    ) -> Option<DateTime<Utc>> {
        let state = self.accounts.entry(account.to_string()).or_default();
        state.consecutive_infra_failures = state.consecutive_infra_failures.saturating_add(1);

        let backoff = policy.backoff(state.consecutive_infra_failures)?;
        let until = now + backoff;
        state.cooldown_until = Some(until);
        warn!(
            account,
            failures = state.consecutive_infra_failures,
            cooldown_secs = backoff.num_seconds(),
            "account placed on cooldown after repeated infrastructure failures"
        );
        Some(until)
    }

    /// Record a success: clears the failure counter and any cooldown.
    /// Returns whether anything changed.
    pub fn record_success(&mut self, account: &str) -> bool {
        match self.accounts.remove(account) {
            Some(state) if state != AccountState::default() => {
                info!(account, "account recovered, cooldown cleared");
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Accounts on cooldown at `now`, soonest expiry first.
    pub fn cooldowns(&self, now: DateTime<Utc>) -> Vec<Cooldown> {
        let mut out: Vec<Cooldown> = self
            .accounts
            .iter()
            .filter_map(|(account, state)| {
                state
                    .cooldown_until
                    .filter(|until| *until > now)
                    .map(|until| Cooldown {
                        account: account.clone(),
                        until,
                        consecutive_infra_failures: state.consecutive_infra_failures,
                    })
            })
            .collect();
        out.sort_by(|a, b| a.until.cmp(&b.until).then_with(|| a.account.cmp(&b.account)));
        out
    }
}
