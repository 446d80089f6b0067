//! Process liveness, enumeration and termination.
//!
//! The lease, the duplicate-instance guard and `stop-all` reach other
//! processes only through [`ProcessTable`]; tests substitute
//! [`FakeProcessTable`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, Signal, System, UpdateKind};

/// A running process as seen by [`ProcessTable::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Parent pid, when the platform reports one.
    pub parent: Option<u32>,
    /// Full command line, arguments joined by spaces.
    pub command: String,
}

/// Pids of `pid`'s parent, grandparent and so on, nearest first.
///
/// Stops at the first pid missing from `processes` and never loops on a
/// cyclic parent chain.
pub fn ancestors(processes: &[ProcessInfo], pid: u32) -> Vec<u32> {
    let parents: HashMap<u32, Option<u32>> =
        processes.iter().map(|p| (p.pid, p.parent)).collect();
    let mut chain = Vec::new();
    let mut current = pid;
    while let Some(Some(parent)) = parents.get(&current) {
        if *parent == pid || chain.contains(parent) {
            break;
        }
        chain.push(*parent);
        current = *parent;
    }
    chain
}

/// The operating system's processes.
pub trait ProcessTable: Send + Sync {
    /// Whether a process with `pid` currently exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// All processes whose command line could be read.
    fn list(&self) -> Vec<ProcessInfo>;

    /// Ask `pid` to shut down (SIGTERM). Returns whether the signal was delivered.
    fn terminate(&self, pid: u32) -> bool;
}

/// The real process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    /// A snapshot of the single process `pid`.
    fn snapshot(pid: u32) -> System {
        let mut system = System::new_with_specifics(RefreshKind::nothing());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::nothing(),
        );
        system
    }
}

impl ProcessTable for SystemProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        Self::snapshot(pid).process(Pid::from_u32(pid)).is_some()
    }

    fn terminate(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        Self::snapshot(pid)
            .process(Pid::from_u32(pid))
            .and_then(|process| process.kill_with(Signal::Term))
            .unwrap_or(false)
    }

    fn list(&self) -> Vec<ProcessInfo> {
        let mut system = System::new_with_specifics(RefreshKind::nothing());
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        let mut out: Vec<ProcessInfo> = system
            .processes()
            .iter()
            // Threads show up as tasks sharing their process's command line.
            .filter(|(_, process)| process.thread_kind().is_none())
            .filter_map(|(pid, process)| {
                let command = process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .filter(|arg| !arg.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                // Kernel threads have no command line.
                (!command.is_empty()).then(|| ProcessInfo {
                    pid: pid.as_u32(),
                    parent: process.parent().map(|p| p.as_u32()),
                    command,
                })
            })
            .collect();
        out.sort_by_key(|p| p.pid);
        out
    }
}

/// An in-memory process table for tests.
///
/// `terminate` removes the process and remembers the pid.
#[derive(Debug, Clone, Default)]
pub struct FakeProcessTable {
    processes: Arc<Mutex<BTreeMap<u32, (Option<u32>, String)>>>,
    terminated: Arc<Mutex<Vec<u32>>>,
}

impl FakeProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running process with no known parent.
    pub fn spawn(&self, pid: u32, command: impl Into<String>) {
        self.insert(pid, None, command.into());
    }

    /// Register a running process started by `parent`.
    pub fn spawn_child(&self, pid: u32, parent: u32, command: impl Into<String>) {
        self.insert(pid, Some(parent), command.into());
    }

    fn insert(&self, pid: u32, parent: Option<u32>, command: String) {
        if let Ok(mut processes) = self.processes.lock() {
            processes.insert(pid, (parent, command));
        }
    }

    /// Remove a process, as if it exited.
    pub fn kill(&self, pid: u32) {
        if let Ok(mut processes) = self.processes.lock() {
            processes.remove(&pid);
        }
    }

    /// Pids that received `terminate`, in order.
    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

impl ProcessTable for FakeProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        self.processes
            .lock()
            .map(|p| p.contains_key(&pid))
            .unwrap_or(false)
    }

    fn list(&self) -> Vec<ProcessInfo> {
        self.processes
            .lock()
            .map(|p| {
                p.iter()
                    .map(|(pid, (parent, command))| ProcessInfo {
                        pid: *pid,
                        parent: *parent,
                        command: command.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn terminate(&self, pid: u32) -> bool {
        let existed = self
            .processes
            .lock()
            .map(|mut p| p.remove(&pid).is_some())
            .unwrap_or(false);
        if existed && let Ok(mut terminated) = self.terminated.lock() {
            terminated.push(pid);
        }
        existed
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let table = SystemProcessTable;
        assert!(table.is_alive(std::process::id()));
        assert!(!table.is_alive(0));
        assert!(!table.is_alive(u32::MAX));
    }

    #[test]
    fn test_list_includes_current_process() {
        let me = std::process::id();
        let listed = SystemProcessTable.list();
        let own = listed.iter().find(|p| p.pid == me).unwrap();
        assert!(own.parent.is_some());
        assert!(ancestors(&listed, me).contains(&own.parent.unwrap()));
    }

    #[test]
    fn test_list_skips_own_threads() {
        let me = std::process::id();
        let worker = std::thread::spawn(|| std::thread::sleep(std::time::Duration::from_millis(300)));
        let listed = SystemProcessTable.list();
        let own_command = &listed.iter().find(|p| p.pid == me).unwrap().command;
        assert!(
            listed
                .iter()
                .all(|p| p.parent != Some(me) || &p.command != own_command)
        );
        worker.join().unwrap();
    }

    #[test]
    fn test_ancestor_chain() {
        let table = FakeProcessTable::new();
        table.spawn(1, "init");
        table.spawn_child(50, 1, "sh -c quill run");
        table.spawn_child(60, 50, "sudo quill run");
        table.spawn_child(70, 60, "quill run");
        table.spawn_child(80, 1, "quill run");

        let listed = table.list();
        assert_eq!(ancestors(&listed, 70), vec![60, 50, 1]);
        assert_eq!(ancestors(&listed, 80), vec![1]);
        assert!(ancestors(&listed, 1).is_empty());
        assert!(ancestors(&listed, 999).is_empty());
    }

    #[test]
    fn test_ancestor_cycle_terminates() {
        let table = FakeProcessTable::new();
        table.spawn_child(2, 3, "a");
        table.spawn_child(3, 2, "b");
        assert_eq!(ancestors(&table.list(), 2), vec![3]);
    }

    #[test]
    fn test_fake_table() {
        let table = FakeProcessTable::new();
        table.spawn(42, "quill run");
        assert!(table.is_alive(42));
        assert_eq!(table.list().len(), 1);

        table.kill(42);
        assert!(!table.is_alive(42));
        assert!(table.list().is_empty());

        table.spawn(7, "quill run");
        assert!(table.terminate(7));
        assert!(!table.terminate(7));
        assert_eq!(table.terminated(), vec![7]);
    }
}
