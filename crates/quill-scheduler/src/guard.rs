//! Duplicate-instance guard.
//!
//! A one-shot scan of the process table for another orchestrator, run before
//! the ledger is touched. It is independent of the lease: the lease protects
//! the ledger from two schedulers, the guard stops a second orchestrator
//! before it starts workers at all.

use std::path::Path;
use std::sync::Arc;

use quill_ledger::{ProcessInfo, ProcessTable, ancestors};
use tracing::warn;

use crate::SchedulerError;

/// How an orchestrator process looks on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSignature {
    /// Executable file name.
    pub program: String,
    /// Subcommand that starts an orchestrator.
    pub subcommand: String,
}

impl Default for InstanceSignature {
    fn default() -> Self {
        Self {
            program: "quill".to_string(),
            subcommand: "run".to_string(),
        }
    }
}

impl InstanceSignature {
    /// `program` appears as an executable name, followed later by `subcommand`.
    pub fn matches(&self, command: &str) -> bool {
        let mut args = command.split_whitespace();
        let found_program = args.by_ref().any(|arg| {
            Path::new(arg)
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == self.program)
        });
        found_program && args.any(|arg| arg == self.subcommand)
    }
}

/// Scans for other orchestrators, excluding `own_pid` and the processes
/// that started it (`sudo`, `sh -c`, `timeout` and similar wrappers).
#[derive(Clone)]
pub struct InstanceGuard {
    processes: Arc<dyn ProcessTable>,
    own_pid: u32,
    signature: InstanceSignature,
}

impl InstanceGuard {
    pub fn new(processes: Arc<dyn ProcessTable>, own_pid: u32) -> Self {
        Self {
            processes,
            own_pid,
            signature: InstanceSignature::default(),
        }
    }

    pub fn with_signature(mut self, signature: InstanceSignature) -> Self {
        self.signature = signature;
        self
    }

    /// Other running orchestrators.
    pub fn find_peers(&self) -> Vec<ProcessInfo> {
        let listed = self.processes.list();
        let mut own_chain = ancestors(&listed, self.own_pid);
        own_chain.push(self.own_pid);
        listed
            .into_iter()
            .filter(|p| !own_chain.contains(&p.pid) && self.signature.matches(&p.command))
            .collect()
    }

    /// Refuse to start when a peer is running, unless `allow_duplicate`.
    pub fn check(&self, allow_duplicate: bool) -> Result<(), SchedulerError> {
        let peers = self.find_peers();
        let Some(peer) = peers.first() else {
            return Ok(());
        };
        if allow_duplicate {
            warn!(
                peers = peers.len(),
                pid = peer.pid,
                "another orchestrator is running; continuing because duplicates are allowed"
            );
            return Ok(());
        }
        Err(SchedulerError::DuplicateInstance {
            pid: peer.pid,
            command: peer.command.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use quill_ledger::FakeProcessTable;

    use super::*;

    #[test]
    fn test_signature_matching() {
        let sig = InstanceSignature::default();
        assert!(sig.matches("quill run"));
        assert!(sig.matches("/usr/local/bin/quill --ledger x.tsv run --workers 3"));
        assert!(!sig.matches("quill status"));
        assert!(!sig.matches("vim quill.toml run"));
        assert!(!sig.matches("run quill"));
        assert!(!sig.matches("/usr/bin/quill-helper run"));
    }

    #[test]
    fn test_guard_excludes_self() {
        let processes = FakeProcessTable::new();
        processes.spawn(100, "quill run");
        processes.spawn(101, "quill status");
        let guard = InstanceGuard::new(Arc::new(processes.clone()), 100);
        assert!(guard.find_peers().is_empty());
        guard.check(false).unwrap();
    }

    #[test]
    fn test_guard_ignores_wrapper_parents() {
        let processes = FakeProcessTable::new();
        processes.spawn(1, "/sbin/init");
        processes.spawn_child(98, 1, "sh -c timeout 3600 quill run --workers 2");
        processes.spawn_child(99, 98, "sudo quill run --workers 2");
        processes.spawn_child(100, 99, "quill run --workers 2");
        let guard = InstanceGuard::new(Arc::new(processes.clone()), 100);
        assert!(guard.find_peers().is_empty());
        guard.check(false).unwrap();

        // A wrapped orchestrator that is not our ancestor is still a peer.
        processes.spawn_child(200, 1, "sudo quill run");
        processes.spawn_child(201, 200, "quill run");
        let peers: Vec<u32> = guard.find_peers().iter().map(|p| p.pid).collect();
        assert_eq!(peers, vec![200, 201]);
        assert!(matches!(
            guard.check(false),
            Err(SchedulerError::DuplicateInstance { pid: 200, .. })
        ));
    }

    #[test]
    fn test_guard_refuses_peer() {
        let processes = FakeProcessTable::new();
        processes.spawn(100, "quill run");
        processes.spawn(200, "/opt/quill/bin/quill run --workers 2");
        let guard = InstanceGuard::new(Arc::new(processes), 100);

        match guard.check(false) {
            Err(SchedulerError::DuplicateInstance { pid, .. }) => assert_eq!(pid, 200),
            other => panic!("expected duplicate refusal, got {other:?}"),
        }
        guard.check(true).unwrap();
    }
}
