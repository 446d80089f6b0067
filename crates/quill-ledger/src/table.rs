//! In-memory view of the ledger rows and the rules applied to them.
//!
//! Everything here is pure: callers pass `now` and the account states, and
//! the [`Ledger`](crate::Ledger) wraps each call in the lock/read/write cycle.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::account::{AccountStates, Cooldown};
use crate::classify;
use crate::job::{ErrorCategory, Job, JobStatus, JobUpdate, NewJob};

/// Local calendar day of `at`. Job ids, archives and the quota all use it.
pub fn local_day(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// Whether a row stamped `at` belongs to `today`. Unstamped rows do.
fn stamped_on(at: Option<DateTime<Utc>>, today: NaiveDate) -> bool {
    at.is_none_or(|at| local_day(at) == today)
}

/// Per-account counts used by the quota guard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountUsage {
    /// SUCCESS rows completed today.
    pub success: usize,
    /// CLAIMED rows claimed today.
    pub claimed: usize,
    /// CLAIMED rows of any day.
    pub active: usize,
}

impl AccountUsage {
    /// Today's successes plus today's claims: the quantity bounded by the
    /// daily limit.
    pub fn assigned(&self) -> usize {
        self.success + self.claimed
    }

    pub fn in_use(&self) -> bool {
        self.active > 0
    }

    pub fn at_limit(&self, daily_limit: usize) -> bool {
        self.assigned() >= daily_limit
    }
}

/// Aggregate counts for status output and pass accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub pending: usize,
    pub claimed: usize,
    pub retrying: usize,
    pub success: usize,
    pub failed: usize,
    /// FAILED rows by category. Unclassified failures count as unknown.
    pub failed_account: usize,
    pub failed_infrastructure: usize,
    pub failed_unknown: usize,
    pub accounts_on_cooldown: Vec<Cooldown>,
}

impl LedgerStats {
    /// Jobs that can still change state.
    pub fn outstanding(&self) -> usize {
        self.pending + self.claimed + self.retrying
    }

    pub fn count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Claimed => self.claimed,
            JobStatus::Retrying => self.retrying,
            JobStatus::Success => self.success,
            JobStatus::Failed => self.failed,
        }
    }
}

/// The job rows, in ledger order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTable {
    jobs: Vec<Job>,
}

impl JobTable {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self { jobs }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn into_jobs(self) -> Vec<Job> {
        self.jobs
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    /// Usage on the local day of `now` for every account that has any row.
    pub fn usage(&self, now: DateTime<Utc>) -> HashMap<&str, AccountUsage> {
        let today = local_day(now);
        let mut usage: HashMap<&str, AccountUsage> = HashMap::new();
        for job in &self.jobs {
            let entry = usage.entry(job.account.as_str()).or_default();
            match job.status {
                JobStatus::Success if stamped_on(job.completed_at, today) => entry.success += 1,
                JobStatus::Claimed => {
                    entry.active += 1;
                    if stamped_on(job.claimed_at, today) {
                        entry.claimed += 1;
                    }
                }
                _ => {}
            }
        }
        usage
    }

    /// Whether a job for `account` may be claimed right now.
    fn account_claimable(
        usage: &HashMap<&str, AccountUsage>,
        account: &str,
        daily_limit: usize,
        accounts: &AccountStates,
        now: DateTime<Utc>,
    ) -> bool {
        let u = usage.get(account).copied().unwrap_or_default();
        !u.in_use() && !u.at_limit(daily_limit) && !accounts.is_on_cooldown(account, now)
    }

    /// Claim the first PENDING job whose account is not in use, not at its
    /// daily limit and not on cooldown.
    pub fn claim_next(
        &mut self,
        worker_id: &str,
        daily_limit: usize,
        accounts: &AccountStates,
        now: DateTime<Utc>,
    ) -> Option<Job> {
        let idx = {
            let usage = self.usage(now);
            self.jobs.iter().position(|job| {
                job.status == JobStatus::Pending
                    && Self::account_claimable(&usage, &job.account, daily_limit, accounts, now)
            })?
        };
        Some(self.mark_claimed(idx, worker_id, now))
    }

    /// Claim one specific RETRYING job, subject to the same account checks.
    pub fn claim_retry(
        &mut self,
        job_id: &str,
        worker_id: &str,
        daily_limit: usize,
        accounts: &AccountStates,
        now: DateTime<Utc>,
    ) -> Option<Job> {
        let idx = {
            let usage = self.usage(now);
            let idx = self.jobs.iter().position(|j| j.job_id == job_id)?;
            let job = &self.jobs[idx];
            if job.status != JobStatus::Retrying {
                debug!(job_id, status = %job.status, "retry claim skipped: job not retrying");
                return None;
            }
            if !Self::account_claimable(&usage, &job.account, daily_limit, accounts, now) {
                debug!(job_id, account = %job.account, "retry claim skipped: account unavailable");
                return None;
            }
            idx
        };
        Some(self.mark_claimed(idx, worker_id, now))
    }

    fn mark_claimed(&mut self, idx: usize, worker_id: &str, now: DateTime<Utc>) -> Job {
        let job = &mut self.jobs[idx];
        job.status = JobStatus::Claimed;
        job.worker_id = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        job.clone()
    }

    /// RETRYING jobs whose last attempt is at least `min_delay` old.
    ///
    /// A missing or unreadable `last_attempt_at` counts as ready.
    pub fn retry_ready(&self, min_delay: Duration, now: DateTime<Utc>) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Retrying)
            .filter(|j| match j.last_attempt_at {
                Some(at) => now - at >= min_delay,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Apply an outcome report. Returns the updated row, or `None` when the
    /// job does not exist or the transition is not allowed.
    pub fn apply_update(
        &mut self,
        update: &JobUpdate,
        max_error_len: usize,
        now: DateTime<Utc>,
    ) -> Option<Job> {
        let Some(job) = self.jobs.iter_mut().find(|j| j.job_id == update.job_id) else {
            warn!(job_id = %update.job_id, "status update for unknown job");
            return None;
        };

        if !job.status.can_transition_to(update.status) {
            warn!(
                job_id = %job.job_id,
                from = %job.status,
                to = %update.status,
                "rejected status update"
            );
            return None;
        }

        job.status = update.status;
        job.worker_id = Some(update.worker_id.clone());
        job.completed_at = Some(now);
        job.last_attempt_at = Some(now);
        if let Some(pass) = update.pass_number {
            job.pass_number = pass;
        }

        match update.error.as_deref().filter(|e| !e.is_empty()) {
            Some(error) => {
                let class = classify::resolve(update.category, update.error_type.as_deref(), error);
                job.last_error = Some(truncate_chars(error, max_error_len));
                job.error_category = Some(class.category);
                job.error_type = class.error_type;
            }
            None if update.status == JobStatus::Success => {
                job.last_error = None;
                job.error_category = None;
                job.error_type.clear();
            }
            None => {
                job.error_category = Some(update.category.unwrap_or(ErrorCategory::Unknown));
                job.error_type = update.error_type.clone().unwrap_or_default();
            }
        }

        if update.status == JobStatus::Retrying {
            job.attempts = job.attempts.saturating_add(1);
        }

        Some(job.clone())
    }

    /// Merge externally sourced jobs.
    ///
    /// An account is skipped if it is on cooldown, has a PENDING row, or has
    /// a CLAIMED or SUCCESS row from today. Within the batch no account receives more
    /// than `daily_limit` new jobs.
    pub fn seed(
        &mut self,
        new_jobs: &[NewJob],
        daily_limit: usize,
        max_attempts: u32,
        accounts: &AccountStates,
        now: DateTime<Utc>,
    ) -> Vec<Job> {
        let today = local_day(now);
        let occupied: HashSet<String> = self
            .jobs
            .iter()
            .filter(|j| match j.status {
                JobStatus::Pending => true,
                JobStatus::Claimed => stamped_on(j.claimed_at, today),
                JobStatus::Success => stamped_on(j.completed_at, today),
                JobStatus::Retrying | JobStatus::Failed => false,
            })
            .map(|j| j.account.clone())
            .collect();
        let mut ids: HashSet<String> = self.jobs.iter().map(|j| j.job_id.clone()).collect();
        let mut seeded_per_account: HashMap<String, usize> = HashMap::new();
        let mut added = Vec::new();
        let day = today.format("%Y%m%d").to_string();

        for new_job in new_jobs {
            let account = new_job.account.trim();
            if account.is_empty() {
                warn!(payload_ref = %new_job.payload_ref, "skipping sourced job without account");
                continue;
            }
            if occupied.contains(account) {
                debug!(account, "skipping seed: account already has work today");
                continue;
            }
            if accounts.is_on_cooldown(account, now) {
                debug!(account, "skipping seed: account on cooldown");
                continue;
            }
            let count = seeded_per_account.entry(account.to_string()).or_default();
            if *count >= daily_limit {
                debug!(account, daily_limit, "skipping seed: batch already at daily limit");
                continue;
            }
            *count += 1;

            let job_id = next_job_id(&mut ids, account, &day);
            let job = Job::pending(job_id, account, new_job.payload_ref.clone(), max_attempts);
            self.jobs.push(job.clone());
            added.push(job);
        }
        added
    }

    pub fn stats(&self, accounts: &AccountStates, now: DateTime<Utc>) -> LedgerStats {
        let mut stats = LedgerStats {
            total: self.jobs.len(),
            accounts_on_cooldown: accounts.cooldowns(now),
            ..LedgerStats::default()
        };
        for job in &self.jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Claimed => stats.claimed += 1,
                JobStatus::Retrying => stats.retrying += 1,
                JobStatus::Success => stats.success += 1,
                JobStatus::Failed => {
                    stats.failed += 1;
                    match job.error_category {
                        Some(ErrorCategory::Account) => stats.failed_account += 1,
                        Some(ErrorCategory::Infrastructure) => stats.failed_infrastructure += 1,
                        Some(ErrorCategory::Unknown) | None => stats.failed_unknown += 1,
                    }
                }
            }
        }
        stats
    }

    /// Newest timestamp on any row.
    pub fn latest_activity(&self) -> Option<DateTime<Utc>> {
        self.jobs.iter().filter_map(Job::latest_activity).max()
    }
}

fn next_job_id(ids: &mut HashSet<String>, account: &str, day: &str) -> String {
    let mut n = 1usize;
    loop {
        let candidate = format!("{account}-{day}-{n}");
        if ids.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Truncate to at most `max_chars` characters (not bytes).
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::CooldownPolicy;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn table_with(rows: &[(&str, &str, JobStatus)]) -> JobTable {
        JobTable::new(
            rows.iter()
                .map(|(id, account, status)| {
                    let mut job = Job::pending(*id, *account, format!("payload/{id}"), 3);
                    job.status = *status;
                    job
                })
                .collect(),
        )
    }

    fn none() -> AccountStates {
        AccountStates::default()
    }

    #[test]
    fn test_claim_skips_in_use_accounts() {
        let mut table = table_with(&[
            ("a1", "a", JobStatus::Claimed),
            ("a2", "a", JobStatus::Pending),
            ("b1", "b", JobStatus::Pending),
        ]);
        let job = table.claim_next("w1", 5, &none(), Utc::now()).unwrap();
        assert_eq!(job.job_id, "b1");
        assert_eq!(job.status, JobStatus::Claimed);
        assert_eq!(job.worker_id.as_deref(), Some("w1"));
        assert!(job.claimed_at.is_some());

        assert!(table.claim_next("w2", 5, &none(), Utc::now()).is_none());
    }

    #[test]
    fn test_claim_counts_success_plus_claimed() {
        let mut table = table_with(&[
            ("a1", "a", JobStatus::Success),
            ("a2", "a", JobStatus::Pending),
        ]);
        assert!(table.claim_next("w", 1, &none(), Utc::now()).is_none());
        assert_eq!(table.claim_next("w", 2, &none(), Utc::now()).unwrap().job_id, "a2");
    }

    #[test]
    fn test_claim_skips_cooldown_accounts() {
        let now = Utc::now();
        let mut accounts = AccountStates::default();
        for _ in 0..3 {
            accounts.record_infra_failure("a", now, &CooldownPolicy::default());
        }
        let mut table = table_with(&[("a1", "a", JobStatus::Pending)]);
        assert!(table.claim_next("w", 5, &accounts, now).is_none());
        let later = now + Duration::hours(2);
        assert!(table.claim_next("w", 5, &accounts, later).is_some());
    }

    #[test]
    fn test_claim_retry_requires_retrying_status() {
        let mut table = table_with(&[
            ("a1", "a", JobStatus::Pending),
            ("b1", "b", JobStatus::Retrying),
        ]);
        assert!(table.claim_retry("a1", "w", 5, &none(), Utc::now()).is_none());
        assert!(table.claim_retry("missing", "w", 5, &none(), Utc::now()).is_none());
        let job = table.claim_retry("b1", "w", 5, &none(), Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Claimed);
    }

    #[test]
    fn test_claim_retry_respects_quota() {
        let mut table = table_with(&[
            ("a1", "a", JobStatus::Success),
            ("a2", "a", JobStatus::Retrying),
        ]);
        assert!(table.claim_retry("a2", "w", 1, &none(), Utc::now()).is_none());
    }

    #[test]
    fn test_retry_transition_and_delay() {
        let now = Utc::now();
        let mut table = table_with(&[("a1", "a", JobStatus::Claimed)]);
        table.jobs[0].attempts = 1;

        let update = JobUpdate::failure("a1", "w", JobStatus::Retrying, "connection reset")
            .classified(Some(ErrorCategory::Infrastructure), "connection");
        let job = table.apply_update(&update, 500, now).unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempts, 2);

        let delay = Duration::minutes(5);
        assert!(table.retry_ready(delay, now).is_empty());
        assert!(table.retry_ready(delay, now + Duration::minutes(4)).is_empty());
        assert_eq!(table.retry_ready(delay, now + Duration::minutes(5)).len(), 1);
    }

    #[test]
    fn test_retry_ready_fails_open_without_timestamp() {
        let table = table_with(&[("a1", "a", JobStatus::Retrying)]);
        assert_eq!(table.retry_ready(Duration::hours(24), Utc::now()).len(), 1);
    }

    #[test]
    fn test_update_falls_back_to_classifier() {
        let mut table = table_with(&[("a1", "a", JobStatus::Claimed)]);
        let update = JobUpdate::failure("a1", "w", JobStatus::Failed, "Account suspended");
        let job = table.apply_update(&update, 500, Utc::now()).unwrap();
        assert_eq!(job.error_category, Some(ErrorCategory::Account));
        assert_eq!(job.error_type, "suspended");
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn test_update_truncates_error() {
        let mut table = table_with(&[("a1", "a", JobStatus::Claimed)]);
        let long = "é".repeat(50);
        let update = JobUpdate::failure("a1", "w", JobStatus::Failed, long);
        let job = table.apply_update(&update, 10, Utc::now()).unwrap();
        assert_eq!(job.last_error.unwrap(), format!("{}...", "é".repeat(10)));
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut table = table_with(&[("a1", "a", JobStatus::Failed)]);
        for status in JobStatus::ALL {
            let update = JobUpdate::failure("a1", "w", status, "again");
            assert!(table.apply_update(&update, 500, Utc::now()).is_none());
        }
        assert!(table.claim_retry("a1", "w", 5, &none(), Utc::now()).is_none());
        assert_eq!(table.get("a1").unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_success_clears_error_fields() {
        let mut table = table_with(&[("a1", "a", JobStatus::Claimed)]);
        table.jobs[0].last_error = Some("old".to_string());
        table.jobs[0].error_category = Some(ErrorCategory::Infrastructure);
        let job = table
            .apply_update(&JobUpdate::success("a1", "w").in_pass(2), 500, Utc::now())
            .unwrap();
        assert_eq!(job.last_error, None);
        assert_eq!(job.error_category, None);
        assert_eq!(job.pass_number, 2);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_seed_caps_batch_at_daily_limit() {
        let mut table = JobTable::default();
        let batch = vec![NewJob::new("a", "p1"), NewJob::new("a", "p2")];
        let added = table.seed(&batch, 1, 5, &none(), Utc::now());
        assert_eq!(added.len(), 1);
        assert_eq!(table.jobs().len(), 1);
        assert_eq!(table.jobs()[0].status, JobStatus::Pending);
        assert_eq!(table.jobs()[0].max_attempts, 5);
    }

    #[test]
    fn test_seed_skips_occupied_accounts() {
        let mut table = table_with(&[
            ("a1", "a", JobStatus::Success),
            ("b1", "b", JobStatus::Failed),
            ("c1", "c", JobStatus::Claimed),
        ]);
        let batch = vec![
            NewJob::new("a", "x"),
            NewJob::new("b", "x"),
            NewJob::new("c", "x"),
            NewJob::new("d", "x"),
        ];
        let added = table.seed(&batch, 3, 5, &none(), Utc::now());
        let accounts: Vec<&str> = added.iter().map(|j| j.account.as_str()).collect();
        assert_eq!(accounts, vec!["b", "d"]);
    }

    #[test]
    fn test_earlier_days_do_not_block_seeding() {
        let now = Utc::now();
        let yesterday = now - Duration::days(1);
        let mut table = table_with(&[
            ("a1", "a", JobStatus::Success),
            ("b1", "b", JobStatus::Claimed),
            ("c1", "c", JobStatus::Success),
        ]);
        table.jobs[0].completed_at = Some(yesterday);
        table.jobs[1].claimed_at = Some(yesterday);
        table.jobs[2].completed_at = Some(now);

        let batch = vec![NewJob::new("a", "x"), NewJob::new("b", "x"), NewJob::new("c", "x")];
        let added = table.seed(&batch, 1, 5, &none(), now);
        let accounts: Vec<&str> = added.iter().map(|j| j.account.as_str()).collect();
        assert_eq!(accounts, vec!["a", "b"]);
    }

    #[test]
    fn test_quota_counts_only_today() {
        let now = Utc::now();
        let mut table = table_with(&[
            ("a1", "a", JobStatus::Success),
            ("a2", "a", JobStatus::Pending),
        ]);
        table.jobs[0].completed_at = Some(now - Duration::days(2));
        let usage = table.usage(now);
        assert_eq!(usage["a"], AccountUsage::default());
        assert_eq!(table.claim_next("w", 1, &none(), now).unwrap().job_id, "a2");
    }

    #[test]
    fn test_stale_claim_still_holds_account() {
        let now = Utc::now();
        let mut table = table_with(&[
            ("a1", "a", JobStatus::Claimed),
            ("a2", "a", JobStatus::Pending),
        ]);
        table.jobs[0].claimed_at = Some(now - Duration::days(1));
        let usage = table.usage(now);
        assert_eq!(usage["a"].assigned(), 0);
        assert!(usage["a"].in_use());
        assert!(table.claim_next("w", 5, &none(), now).is_none());
    }

    #[test]
    fn test_seed_generates_unique_ids() {
        let now = Utc::now();
        let mut table = JobTable::default();
        let batch = vec![NewJob::new("a", "p1"), NewJob::new("a", "p2")];
        let added = table.seed(&batch, 2, 5, &none(), now);
        let day = now.with_timezone(&Local).format("%Y%m%d");
        assert_eq!(added[0].job_id, format!("a-{day}-1"));
        assert_eq!(added[1].job_id, format!("a-{day}-2"));
    }

    #[test]
    fn test_stats_counts_categories() {
        let mut table = table_with(&[
            ("a1", "a", JobStatus::Failed),
            ("b1", "b", JobStatus::Failed),
            ("c1", "c", JobStatus::Failed),
            ("d1", "d", JobStatus::Retrying),
            ("e1", "e", JobStatus::Success),
        ]);
        table.jobs[0].error_category = Some(ErrorCategory::Account);
        table.jobs[1].error_category = Some(ErrorCategory::Infrastructure);
        let stats = table.stats(&none(), Utc::now());
        assert_eq!(stats.total, 5);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.failed_account, 1);
        assert_eq!(stats.failed_infrastructure, 1);
        assert_eq!(stats.failed_unknown, 1);
        assert_eq!(stats.retrying, 1);
        assert_eq!(stats.outstanding(), 1);
    }

    proptest! {
        #[test]
        fn seeding_never_exceeds_daily_limit(
            accounts in prop::collection::vec(0u8..4, 0..30),
            limit in 0usize..4,
        ) {
            let mut table = JobTable::default();
            let batch: Vec<NewJob> = accounts
                .iter()
                .enumerate()
                .map(|(i, a)| NewJob::new(format!("acct{a}"), format!("p{i}")))
                .collect();
            table.seed(&batch, limit, 5, &AccountStates::default(), Utc::now());

            let mut per_account: HashMap<&str, usize> = HashMap::new();
            for job in table.jobs() {
                *per_account.entry(job.account.as_str()).or_default() += 1;
            }
            for count in per_account.values() {
                prop_assert!(*count <= limit);
            }
        }

        #[test]
        fn claims_never_exceed_quota(
            rows in prop::collection::vec((0u8..3, 0u8..3), 1..25),
            limit in 1usize..4,
            workers in 1usize..6,
        ) {
            let statuses = [JobStatus::Pending, JobStatus::Success, JobStatus::Retrying];
            let mut jobs = Vec::new();
            let mut success_per_account: HashMap<String, usize> = HashMap::new();
            for (i, (account, status)) in rows.iter().enumerate() {
                let account = format!("acct{account}");
                let mut status = statuses[*status as usize];
                // Start from a state that already respects the quota.
                if status == JobStatus::Success {
                    let n = success_per_account.entry(account.clone()).or_default();
                    if *n >= limit {
                        status = JobStatus::Pending;
                    } else {
                        *n += 1;
                    }
                }
                let mut job = Job::pending(format!("j{i}"), account, "p", 3);
                job.status = status;
                jobs.push(job);
            }
            let mut table = JobTable::new(jobs);
            for w in 0..workers {
                let _ = table.claim_next(&format!("w{w}"), limit, &AccountStates::default(), Utc::now());
            }
            for usage in table.usage(Utc::now()).values() {
                prop_assert!(usage.assigned() <= limit);
                prop_assert!(usage.claimed <= 1);
            }
        }
    }
}
