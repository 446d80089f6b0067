//! Stateful property testing for the ledger claim protocol.
//!
//! Drives a real on-disk ledger and a small reference model with the same
//! random sequence of seeds, claims and outcome reports, and checks after
//! every step that both agree and that the quota holds.

use std::collections::HashMap;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tempfile::TempDir;

use quill_ledger::{ErrorCategory, JobStatus, JobUpdate, Ledger, LedgerOptions, NewJob};

const DAILY_LIMIT: usize = 2;
const ACCOUNTS: [&str; 3] = ["alice", "bob", "carol"];
const COOLDOWN_THRESHOLD: u32 = 3;

/// How a claimed job finished.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Success,
    Infrastructure,
    Account,
    Unknown,
}

impl Outcome {
    fn status(self) -> JobStatus {
        match self {
            Outcome::Success => JobStatus::Success,
            Outcome::Infrastructure | Outcome::Unknown => JobStatus::Retrying,
            Outcome::Account => JobStatus::Failed,
        }
    }

    fn category(self) -> Option<ErrorCategory> {
        match self {
            Outcome::Success => None,
            Outcome::Infrastructure => Some(ErrorCategory::Infrastructure),
            Outcome::Account => Some(ErrorCategory::Account),
            Outcome::Unknown => Some(ErrorCategory::Unknown),
        }
    }
}

/// Operations against the ledger.
#[derive(Debug, Clone)]
pub enum LedgerOperation {
    Seed { account: usize, copies: usize },
    ClaimNext { worker: usize },
    ClaimRetry { slot: usize, worker: usize },
    Report { slot: usize, outcome: Outcome },
}

#[derive(Debug, Clone)]
pub struct ModelRow {
    pub account: usize,
    pub status: JobStatus,
    pub attempts: u32,
}

/// Reference model of the ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerModel {
    pub rows: Vec<ModelRow>,
    pub infra_failures: HashMap<usize, u32>,
}

impl LedgerModel {
    fn count(&self, account: usize, status: JobStatus) -> usize {
        self.rows
            .iter()
            .filter(|r| r.account == account && r.status == status)
            .count()
    }

    fn on_cooldown(&self, account: usize) -> bool {
        self.infra_failures.get(&account).copied().unwrap_or(0) >= COOLDOWN_THRESHOLD
    }

    fn claimable(&self, account: usize) -> bool {
        let claimed = self.count(account, JobStatus::Claimed);
        let success = self.count(account, JobStatus::Success);
        claimed == 0 && success + claimed < DAILY_LIMIT && !self.on_cooldown(account)
    }

    /// Row index of the `slot`-th row (modulo) with `status`.
    fn nth_with(&self, status: JobStatus, slot: usize) -> Option<usize> {
        let matching: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == status)
            .map(|(i, _)| i)
            .collect();
        if matching.is_empty() {
            None
        } else {
            Some(matching[slot % matching.len()])
        }
    }
}

impl ReferenceStateMachine for LedgerModel {
    type State = Self;
    type Transition = LedgerOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let outcome = prop_oneof![
            Just(Outcome::Success),
            Just(Outcome::Infrastructure),
            Just(Outcome::Account),
            Just(Outcome::Unknown),
        ];
        prop_oneof![
            2 => (0..ACCOUNTS.len(), 1usize..4)
                .prop_map(|(account, copies)| LedgerOperation::Seed { account, copies }),
            3 => (0usize..4).prop_map(|worker| LedgerOperation::ClaimNext { worker }),
            2 => (0usize..8, 0usize..4)
                .prop_map(|(slot, worker)| LedgerOperation::ClaimRetry { slot, worker }),
            3 => (0usize..8, outcome)
                .prop_map(|(slot, outcome)| LedgerOperation::Report { slot, outcome }),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            LedgerOperation::Seed { account, copies } => {
                let occupied = state.rows.iter().any(|r| {
                    r.account == *account
                        && matches!(
                            r.status,
                            JobStatus::Pending | JobStatus::Claimed | JobStatus::Success
                        )
                });
                if !occupied && !state.on_cooldown(*account) {
                    for _ in 0..(*copies).min(DAILY_LIMIT) {
                        state.rows.push(ModelRow {
                            account: *account,
                            status: JobStatus::Pending,
                            attempts: 0,
                        });
                    }
                }
            }
            LedgerOperation::ClaimNext { .. } => {
                let idx = state.rows.iter().position(|r| {
                    r.status == JobStatus::Pending && state.claimable(r.account)
                });
                if let Some(idx) = idx {
                    state.rows[idx].status = JobStatus::Claimed;
                }
            }
            LedgerOperation::ClaimRetry { slot, .. } => {
                if let Some(idx) = state.nth_with(JobStatus::Retrying, *slot) {
                    if state.claimable(state.rows[idx].account) {
                        state.rows[idx].status = JobStatus::Claimed;
                    }
                }
            }
            LedgerOperation::Report { slot, outcome } => {
                if let Some(idx) = state.nth_with(JobStatus::Claimed, *slot) {
                    let account = state.rows[idx].account;
                    let row = &mut state.rows[idx];
                    row.status = outcome.status();
                    if row.status == JobStatus::Retrying {
                        row.attempts += 1;
                    }
                    match outcome {
                        Outcome::Success => {
                            state.infra_failures.remove(&account);
                        }
                        Outcome::Infrastructure => {
                            *state.infra_failures.entry(account).or_default() += 1;
                        }
                        Outcome::Account | Outcome::Unknown => {}
                    }
                }
            }
        }
        state
    }

    fn preconditions(_state: &Self::State, _transition: &Self::Transition) -> bool {
        true
    }
}

/// A real ledger in a scratch directory.
pub struct LedgerHarness {
    _dir: TempDir,
    ledger: Ledger,
}

impl LedgerHarness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let ledger = Ledger::open(dir.path().join("progress.tsv"), LedgerOptions::default())
            .expect("Failed to open ledger");
        Self { _dir: dir, ledger }
    }

    fn nth_job_id(&self, status: JobStatus, slot: usize) -> Option<String> {
        let jobs: Vec<_> = self
            .ledger
            .jobs()
            .expect("Failed to read ledger")
            .into_iter()
            .filter(|j| j.status == status)
            .collect();
        if jobs.is_empty() {
            None
        } else {
            Some(jobs[slot % jobs.len()].job_id.clone())
        }
    }

    fn apply_operation(&self, op: &LedgerOperation) {
        match op {
            LedgerOperation::Seed { account, copies } => {
                let batch: Vec<NewJob> = (0..*copies)
                    .map(|i| NewJob::new(ACCOUNTS[*account], format!("post-{i}")))
                    .collect();
                self.ledger.seed(&batch, DAILY_LIMIT).expect("seed failed");
            }
            LedgerOperation::ClaimNext { worker } => {
                self.ledger
                    .claim_next_job(&format!("w{worker}"), DAILY_LIMIT)
                    .expect("claim failed");
            }
            LedgerOperation::ClaimRetry { slot, worker } => {
                if let Some(job_id) = self.nth_job_id(JobStatus::Retrying, *slot) {
                    self.ledger
                        .claim_retry_job(&job_id, &format!("w{worker}"), DAILY_LIMIT)
                        .expect("retry claim failed");
                }
            }
            LedgerOperation::Report { slot, outcome } => {
                if let Some(job_id) = self.nth_job_id(JobStatus::Claimed, *slot) {
                    let update = match outcome {
                        Outcome::Success => JobUpdate::success(&job_id, "w"),
                        other => JobUpdate::failure(&job_id, "w", other.status(), "boom")
                            .classified(other.category(), "test"),
                    };
                    assert!(self.ledger.update_job_status(&update).expect("update failed"));
                }
            }
        }
    }
}

impl StateMachineTest for LedgerHarness {
    type SystemUnderTest = Self;
    type Reference = LedgerModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let jobs = state.ledger.jobs().expect("Failed to read ledger");

        // The ledger matches the model row for row.
        assert_eq!(jobs.len(), ref_state.rows.len());
        for (job, row) in jobs.iter().zip(&ref_state.rows) {
            assert_eq!(job.account, ACCOUNTS[row.account]);
            assert_eq!(job.status, row.status, "job {}", job.job_id);
            assert_eq!(job.attempts, row.attempts, "job {}", job.job_id);
        }

        // Quota and single active claim per account.
        for account in ACCOUNTS {
            let claimed = jobs
                .iter()
                .filter(|j| j.account == account && j.status == JobStatus::Claimed)
                .count();
            let success = jobs
                .iter()
                .filter(|j| j.account == account && j.status == JobStatus::Success)
                .count();
            assert!(claimed <= 1, "{account} has {claimed} active claims");
            assert!(
                success + claimed <= DAILY_LIMIT,
                "{account} exceeds daily limit"
            );
        }

        // Failed rows keep their classification.
        for job in jobs.iter().filter(|j| j.status == JobStatus::Failed) {
            assert_ne!(job.error_category, None, "job {}", job.job_id);
        }
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 40,
        max_shrink_iters: 2000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn ledger_state_machine_test(sequential 1..40 => LedgerHarness);
}
