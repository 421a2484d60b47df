//! # Process Tree Discovery - Descendants and Pid Re-Verification
//!
//! Discovery of the transitive descendant set of a host process, and the
//! pid-reuse guard applied before every sample attribution.
//!
//! A pid is only ever trusted together with its `(name, start_time)` tuple:
//! [`ProcessTreeDiscovery::ensure_process`] re-reads the live process and
//! accepts it only when both still match what was remembered at resolution
//! time. Pid reuse therefore surfaces as a skipped sample, never as a
//! silently mis-attributed one.
//!
//! [`SnapshotProcessTree`] walks one process-table snapshot per observer
//! pass (refreshed through [`ProcessTreeDiscovery::snapshot`]); pids that
//! exit mid-walk simply drop out of the snapshot's parent links.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use sysinfo::{Pid, ProcessRefreshKind, System};

/// A descendant process captured at resolution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildProc {
    pub name: String,
    pub pid: u32,
    /// Process start time, seconds since the epoch.
    pub start_time: u64,
}

/// Descendant discovery and pid re-verification.
pub trait ProcessTreeDiscovery: Send + Sync {
    /// Refresh the process-table snapshot. Called once at the start of
    /// each observer pass.
    fn snapshot(&self);

    /// The transitive descendants of `root_pid` at snapshot time.
    fn children(&self, root_pid: u32) -> Vec<ChildProc>;

    /// All processes with exactly this name at snapshot time.
    fn find_processes_by_name(&self, name: &str) -> Vec<ChildProc>;

    /// `(name, pid, start_time)` of a live process, if it exists.
    fn process_info(&self, pid: u32) -> Option<ChildProc>;

    /// True iff `pid` is still the process remembered as `(name,
    /// start_time)`. Queries live state, not the pass snapshot.
    fn ensure_process(&self, pid: u32, name: &str, start_time: u64) -> bool;
}

/// Process-table snapshot over `sysinfo`.
pub struct SnapshotProcessTree {
    system: Mutex<System>,
}

impl SnapshotProcessTree {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SnapshotProcessTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTreeDiscovery for SnapshotProcessTree {
    fn snapshot(&self) {
        let mut sys = self.system.lock();
        sys.refresh_processes_specifics(ProcessRefreshKind::new());
    }

    fn children(&self, root_pid: u32) -> Vec<ChildProc> {
        let sys = self.system.lock();

        // Invert the parent links once, then breadth-first walk from the
        // root. The snapshot is internally consistent even if processes
        // have exited since it was taken.
        let mut by_parent: HashMap<u32, Vec<&sysinfo::Process>> = HashMap::new();
        for proc in sys.processes().values() {
            if let Some(parent) = proc.parent() {
                by_parent.entry(parent.as_u32()).or_default().push(proc);
            }
        }

        let mut descendants = Vec::new();
        let mut frontier = VecDeque::from([root_pid]);
        while let Some(pid) = frontier.pop_front() {
            if let Some(children) = by_parent.get(&pid) {
                for child in children {
                    descendants.push(ChildProc {
                        name: child.name().to_string(),
                        pid: child.pid().as_u32(),
                        start_time: child.start_time(),
                    });
                    frontier.push_back(child.pid().as_u32());
                }
            }
        }
        descendants
    }

    fn find_processes_by_name(&self, name: &str) -> Vec<ChildProc> {
        let sys = self.system.lock();
        sys.processes()
            .values()
            .filter(|p| p.name() == name)
            .map(|p| ChildProc {
                name: p.name().to_string(),
                pid: p.pid().as_u32(),
                start_time: p.start_time(),
            })
            .collect()
    }

    fn process_info(&self, pid: u32) -> Option<ChildProc> {
        let mut sys = self.system.lock();
        if !sys.refresh_process_specifics(Pid::from_u32(pid), ProcessRefreshKind::new()) {
            return None;
        }
        sys.process(Pid::from_u32(pid)).map(|p| ChildProc {
            name: p.name().to_string(),
            pid,
            start_time: p.start_time(),
        })
    }

    fn ensure_process(&self, pid: u32, name: &str, start_time: u64) -> bool {
        match self.process_info(pid) {
            Some(info) => info.name == name && info.start_time == start_time,
            None => false,
        }
    }
}
