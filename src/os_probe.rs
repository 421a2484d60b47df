//! # OS Probe - Point Samples Over the Host OS
//!
//! The narrow boundary between the observation engine and the operating
//! system. Every call yields a single point-in-time sample; the probe keeps
//! no per-call state beyond the shared process-table snapshot, so the
//! sampler is free to schedule warm-up and measurement calls itself.
//!
//! ## Contract
//!
//! Failure values are part of the contract and are what the sampler keys
//! off of (it never sees an `Err` from a probe):
//!
//! | Operation | Failure value |
//! |---|---|
//! | `cpu_percent` | `-1.0` (process vanished or access denied) |
//! | `working_set_mb`, `private_bytes_mb` | `0.0` |
//! | `handle_count` | `-1` |
//! | `thread_count`, port counts | `0` |
//! | `ephemeral_port_pct`, `commit_limit_gb` | `0.0` |
//! | `physical_memory_info` | zeroed [`MemoryInfo`] |
//!
//! ## Implementation
//!
//! [`SystemProbe`] layers `sysinfo` (process table, CPU, memory) with
//! Linux `procfs` reads for the counters `sysinfo` does not expose: file
//! descriptor counts, thread counts, TCP socket inodes, the dynamic port
//! range, and the commit limit. On non-Linux builds those probes return
//! their documented failure values; the engine treats the metrics as
//! absent.
//!
//! Working-set queries accept an optional process name. When more than
//! `fast_path_threshold` processes share that name, the probe skips the
//! name-scoped enumeration and refreshes the pid directly - enumerating a
//! large same-named cohort is quadratic in the table size.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Default same-named-process count past which the working-set probe
/// switches to the direct-pid path.
pub const DEFAULT_FAST_PATH_THRESHOLD: usize = 50;

/// Physical memory totals for the node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_gb: f64,
    pub used_gb: f64,
    pub used_pct: f64,
}

/// Point-sample probe over the host OS.
///
/// Implementations must be safe under concurrent use; the sampler invokes
/// the probe from parallel target workers.
pub trait OsProbe: Send + Sync {
    /// CPU usage of `pid` as a percentage of total node CPU, `0..=100`,
    /// or `-1.0` when the process has vanished or access was denied.
    /// The first call after process discovery is a warm-up; only
    /// subsequent calls carry a meaningful delta.
    fn cpu_percent(&self, pid: u32) -> f64;

    /// Resident working set of `pid` in MB, or `0.0` on failure.
    ///
    /// `proc_name` enables the name-scoped path used when attributing
    /// memory to one of several same-named processes; `use_private`
    /// substitutes the private-bytes reading for the resident set.
    fn working_set_mb(&self, pid: u32, proc_name: Option<&str>, use_private: bool) -> f64;

    /// Private (unshared) bytes of `pid` in MB, or `0.0` on failure.
    fn private_bytes_mb(&self, pid: u32) -> f64;

    /// Open handle / file-descriptor count, or `-1` on failure.
    fn handle_count(&self, pid: u32) -> i64;

    /// Thread count, or `0` on failure.
    fn thread_count(&self, pid: u32) -> i64;

    /// Count of TCP connections owned by `pid`, or `0` on failure.
    fn active_tcp_port_count(&self, pid: u32) -> i64;

    /// Count of `pid`'s TCP connections bound to a local port inside the
    /// dynamic range, or `0` on failure.
    fn active_ephemeral_port_count(&self, pid: u32) -> i64;

    /// `pid`'s ephemeral port usage as a percentage of the dynamic range,
    /// `0..=100`.
    fn ephemeral_port_pct(&self, pid: u32) -> f64;

    /// The OS dynamic (ephemeral) port range, when known.
    fn ephemeral_port_range(&self) -> Option<(u16, u16)>;

    /// System commit limit in GB, or `0.0` on failure.
    fn commit_limit_gb(&self) -> f64;

    /// Physical memory totals; zeroed on failure.
    fn physical_memory_info(&self) -> MemoryInfo;

    /// OS identity string for operational telemetry.
    fn os_identity(&self) -> String;
}

/// Production probe over `sysinfo` and, on Linux, `procfs`.
pub struct SystemProbe {
    system: Mutex<System>,
    fast_path_threshold: usize,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::with_fast_path_threshold(DEFAULT_FAST_PATH_THRESHOLD)
    }

    /// From agent settings: picks up the configured same-named-process
    /// threshold for the working-set fast path.
    pub fn from_settings(settings: &crate::config::AgentSettings) -> Self {
        Self::with_fast_path_threshold(settings.working_set_fast_path_threshold)
    }

    /// Create a probe with a custom same-named-process threshold for the
    /// working-set fast path.
    pub fn with_fast_path_threshold(fast_path_threshold: usize) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            fast_path_threshold: fast_path_threshold.max(1),
        }
    }

    fn refresh_pid(&self, sys: &mut System, pid: u32, kind: ProcessRefreshKind) -> bool {
        sys.refresh_process_specifics(Pid::from_u32(pid), kind)
    }

    fn resident_mb(&self, pid: u32) -> f64 {
        let mut sys = self.system.lock();
        if !self.refresh_pid(&mut sys, pid, ProcessRefreshKind::new().with_memory()) {
            return 0.0;
        }
        sys.process(Pid::from_u32(pid))
            .map(|p| p.memory() as f64 / BYTES_PER_MB)
            .unwrap_or(0.0)
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl OsProbe for SystemProbe {
    fn cpu_percent(&self, pid: u32) -> f64 {
        let mut sys = self.system.lock();
        if !self.refresh_pid(&mut sys, pid, ProcessRefreshKind::new().with_cpu()) {
            return -1.0;
        }
        let cores = sys.cpus().len().max(1) as f64;
        match sys.process(Pid::from_u32(pid)) {
            // sysinfo reports percent-of-one-core; normalize to
            // percent-of-node so thresholds compare against 0..100.
            Some(p) => f64::from(p.cpu_usage()) / cores,
            None => -1.0,
        }
    }

    fn working_set_mb(&self, pid: u32, proc_name: Option<&str>, use_private: bool) -> f64 {
        if use_private {
            return self.private_bytes_mb(pid);
        }
        if let Some(name) = proc_name {
            let mut sys = self.system.lock();
            sys.refresh_processes_specifics(ProcessRefreshKind::new().with_memory());
            let same_named = sys.processes_by_exact_name(name).count();
            if same_named > 0 && same_named <= self.fast_path_threshold {
                return sys
                    .processes_by_exact_name(name)
                    .find(|p| p.pid() == Pid::from_u32(pid))
                    .map(|p| p.memory() as f64 / BYTES_PER_MB)
                    .unwrap_or(0.0);
            }
            // Past the threshold, fall through to the direct-pid path.
            drop(sys);
        }
        self.resident_mb(pid)
    }

    fn private_bytes_mb(&self, pid: u32) -> f64 {
        #[cfg(target_os = "linux")]
        {
            linux::private_bytes_mb(pid).unwrap_or(0.0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            // Without an unshared-page reading, fall back to the resident
            // set so percent-of-commit evaluation still has a numerator.
            self.resident_mb(pid)
        }
    }

    fn handle_count(&self, pid: u32) -> i64 {
        #[cfg(target_os = "linux")]
        {
            linux::fd_count(pid).unwrap_or(-1)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pid;
            -1
        }
    }

    fn thread_count(&self, pid: u32) -> i64 {
        #[cfg(target_os = "linux")]
        {
            linux::thread_count(pid).unwrap_or(0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pid;
            0
        }
    }

    fn active_tcp_port_count(&self, pid: u32) -> i64 {
        #[cfg(target_os = "linux")]
        {
            linux::tcp_port_count(pid, None).unwrap_or(0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pid;
            0
        }
    }

    fn active_ephemeral_port_count(&self, pid: u32) -> i64 {
        #[cfg(target_os = "linux")]
        {
            match self.ephemeral_port_range() {
                Some(range) => linux::tcp_port_count(pid, Some(range)).unwrap_or(0),
                None => 0,
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pid;
            0
        }
    }

    fn ephemeral_port_pct(&self, pid: u32) -> f64 {
        let Some((lo, hi)) = self.ephemeral_port_range() else {
            return 0.0;
        };
        let span = f64::from(hi) - f64::from(lo) + 1.0;
        if span <= 0.0 {
            return 0.0;
        }
        let in_use = self.active_ephemeral_port_count(pid) as f64;
        ((in_use * 100.0) / span).clamp(0.0, 100.0)
    }

    fn ephemeral_port_range(&self) -> Option<(u16, u16)> {
        #[cfg(target_os = "linux")]
        {
            linux::ephemeral_port_range()
        }
        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }

    fn commit_limit_gb(&self) -> f64 {
        #[cfg(target_os = "linux")]
        {
            linux::commit_limit_gb().unwrap_or(0.0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            0.0
        }
    }

    fn physical_memory_info(&self) -> MemoryInfo {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        let total = sys.total_memory() as f64;
        let used = sys.used_memory() as f64;
        if total <= 0.0 {
            return MemoryInfo::default();
        }
        MemoryInfo {
            total_gb: total / BYTES_PER_GB,
            used_gb: used / BYTES_PER_GB,
            used_pct: (used * 100.0) / total,
        }
    }

    fn os_identity(&self) -> String {
        format!(
            "{} {}",
            System::name().unwrap_or_else(|| "unknown".to_string()),
            System::os_version().unwrap_or_else(|| "unknown".to_string()),
        )
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use procfs::net::TcpState;
    use std::collections::HashSet;

    pub fn private_bytes_mb(pid: u32) -> Option<f64> {
        let proc = procfs::process::Process::new(pid as i32).ok()?;
        let status = proc.status().ok()?;
        // Resident minus file-backed and shmem pages: the process's own
        // commit charge. Status fields are reported in kB.
        let rss_kb = status.vmrss?;
        let shared_kb = status.rssfile.unwrap_or(0) + status.rssshmem.unwrap_or(0);
        Some(rss_kb.saturating_sub(shared_kb) as f64 / 1024.0)
    }

    pub fn fd_count(pid: u32) -> Option<i64> {
        let proc = procfs::process::Process::new(pid as i32).ok()?;
        proc.fd_count().ok().map(|n| n as i64)
    }

    pub fn thread_count(pid: u32) -> Option<i64> {
        let proc = procfs::process::Process::new(pid as i32).ok()?;
        proc.stat().ok().map(|s| s.num_threads)
    }

    /// Count TCP entries whose socket inode belongs to `pid`, optionally
    /// restricted to local ports inside `range`. Listen-state sockets
    /// count toward the total but never toward the ephemeral total.
    pub fn tcp_port_count(pid: u32, range: Option<(u16, u16)>) -> Option<i64> {
        let proc = procfs::process::Process::new(pid as i32).ok()?;
        let inodes: HashSet<u64> = proc
            .fd()
            .ok()?
            .filter_map(|fd| fd.ok())
            .filter_map(|fd| match fd.target {
                procfs::process::FDTarget::Socket(inode) => Some(inode),
                _ => None,
            })
            .collect();
        if inodes.is_empty() {
            return Some(0);
        }

        let mut entries = procfs::net::tcp().unwrap_or_default();
        entries.extend(procfs::net::tcp6().unwrap_or_default());

        let count = entries
            .iter()
            .filter(|e| inodes.contains(&e.inode))
            .filter(|e| match range {
                Some((lo, hi)) => {
                    e.state != TcpState::Listen
                        && e.local_address.port() >= lo
                        && e.local_address.port() <= hi
                }
                None => true,
            })
            .count();
        Some(count as i64)
    }

    pub fn ephemeral_port_range() -> Option<(u16, u16)> {
        let raw = std::fs::read_to_string("/proc/sys/net/ipv4/ip_local_port_range").ok()?;
        let mut parts = raw.split_whitespace();
        let lo: u16 = parts.next()?.parse().ok()?;
        let hi: u16 = parts.next()?.parse().ok()?;
        (lo <= hi).then_some((lo, hi))
    }

    pub fn commit_limit_gb() -> Option<f64> {
        let meminfo = <procfs::Meminfo as procfs::Current>::current().ok()?;
        meminfo
            .commit_limit
            .map(|bytes| bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
