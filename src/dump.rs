//! # Process Dumps - Diagnostic Capture on Threshold Breach
//!
//! When a target crosses an error (or, if configured, warning) threshold
//! and dumps are enabled for it, the evaluator requests a process dump of
//! the offending pid. Requests pass through a process-wide rate bucket so
//! a flapping service cannot fill the disk: at most `max_dumps` dumps per
//! rolling window, shared across all observers.
//!
//! The dumper itself is a trait; the provided [`CommandDumper`] shells out
//! to `gcore` on Linux and writes under a configured directory as
//! `{process_name}_{pid}_{timestamp}`. Platforms without a dump tool get
//! [`NoopDumper`], which declines every request.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::{ObserverAgentError, Result};

/// Process-wide dump budget over a rolling window. Mutex-protected; shared
/// across observers through the evaluator.
pub struct DumpRateLimiter {
    max_dumps: u32,
    window: Duration,
    taken: Mutex<VecDeque<Instant>>,
}

impl DumpRateLimiter {
    pub fn new(max_dumps: u32, window: Duration) -> Self {
        Self {
            max_dumps,
            window,
            taken: Mutex::new(VecDeque::new()),
        }
    }

    /// Take one slot from the budget; false when the window is exhausted.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut taken = self.taken.lock();
        while let Some(front) = taken.front() {
            if now.duration_since(*front) > self.window {
                taken.pop_front();
            } else {
                break;
            }
        }
        if taken.len() as u32 >= self.max_dumps {
            return false;
        }
        taken.push_back(now);
        true
    }
}

/// Writes a diagnostic dump for a pid.
pub trait ProcessDumper: Send + Sync {
    fn dump(&self, pid: u32, process_name: &str) -> Result<PathBuf>;
}

/// Declines every dump request. Used when no dump directory is configured
/// or the platform has no dump tooling.
pub struct NoopDumper;

impl ProcessDumper for NoopDumper {
    fn dump(&self, _pid: u32, _process_name: &str) -> Result<PathBuf> {
        Err(ObserverAgentError::System(
            "process dumps are not enabled on this node".to_string(),
        ))
    }
}

/// `gcore`-based dumper writing `{name}_{pid}_{timestamp}` files under a
/// configured directory. Refuses when the directory already holds
/// `max_fresh` files younger than the window, so an agent restart cannot
/// defeat the rate bucket.
pub struct CommandDumper {
    dump_dir: PathBuf,
    max_fresh: u32,
    window: Duration,
}

impl CommandDumper {
    pub fn new(dump_dir: impl Into<PathBuf>, max_fresh: u32, window: Duration) -> Self {
        Self {
            dump_dir: dump_dir.into(),
            max_fresh,
            window,
        }
    }

    fn dump_stem(&self, pid: u32, process_name: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        self.dump_dir.join(format!("{process_name}_{pid}_{stamp}"))
    }
}

impl ProcessDumper for CommandDumper {
    #[cfg(target_os = "linux")]
    fn dump(&self, pid: u32, process_name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dump_dir)
            .map_err(|e| ObserverAgentError::System(format!("dump dir: {e}")))?;
        if recent_dump_count(&self.dump_dir, self.window) >= self.max_fresh as usize {
            return Err(ObserverAgentError::System(format!(
                "{} already holds {} fresh dumps",
                self.dump_dir.display(),
                self.max_fresh
            )));
        }
        let stem = self.dump_stem(pid, process_name);

        let output = std::process::Command::new("gcore")
            .arg("-o")
            .arg(&stem)
            .arg(pid.to_string())
            .output()
            .map_err(|e| ObserverAgentError::System(format!("gcore spawn: {e}")))?;

        if !output.status.success() {
            return Err(ObserverAgentError::System(format!(
                "gcore exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        // gcore appends the pid to the stem it is given.
        Ok(PathBuf::from(format!("{}.{pid}", stem.display())))
    }

    #[cfg(not(target_os = "linux"))]
    fn dump(&self, pid: u32, process_name: &str) -> Result<PathBuf> {
        let _ = self.dump_stem(pid, process_name);
        Err(ObserverAgentError::System(
            "no dump tooling on this platform".to_string(),
        ))
    }
}

/// Rate-limited dump front end used by the evaluator.
pub struct DumpManager {
    dumper: Arc<dyn ProcessDumper>,
    limiter: DumpRateLimiter,
}

impl DumpManager {
    pub fn new(dumper: Arc<dyn ProcessDumper>, max_dumps: u32, window: Duration) -> Self {
        Self {
            dumper,
            limiter: DumpRateLimiter::new(max_dumps, window),
        }
    }

    /// From observer settings: a configured dump directory selects the
    /// command dumper, otherwise every request is declined.
    pub fn from_settings(settings: &crate::config::ObserverSettings) -> Self {
        let window = Duration::from_secs(settings.max_dumps_window_secs);
        let dumper: Arc<dyn ProcessDumper> = match &settings.dump_dir {
            Some(dir) => Arc::new(CommandDumper::new(dir, settings.max_dumps, window)),
            None => Arc::new(NoopDumper),
        };
        Self::new(dumper, settings.max_dumps, window)
    }

    /// Request a dump; false when rate-limited or failed. Never propagates:
    /// dump failure must not affect the evaluation pass.
    pub fn request(&self, pid: u32, process_name: &str, reason: &str) -> bool {
        if !self.limiter.try_acquire() {
            warn!(pid, reason, "dump request rate-limited");
            return false;
        }
        match self.dumper.dump(pid, process_name) {
            Ok(path) => {
                info!(pid, reason, path = %path.display(), "process dump written");
                true
            }
            Err(e) => {
                warn!(pid, reason, error = %e, "process dump failed");
                false
            }
        }
    }
}

/// Fresh dump files already present under `dir` within `window`, used to
/// refuse redundant captures after an agent restart.
pub fn recent_dump_count(dir: &Path, window: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let now = std::time::SystemTime::now();
    entries
        .flatten()
        .filter(|e| {
            e.metadata()
                .and_then(|m| m.modified())
                .map(|t| now.duration_since(t).map(|d| d <= window).unwrap_or(true))
                .unwrap_or(false)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_budget() {
        let limiter = DumpRateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_rate_limiter_window_expiry() {
        let limiter = DumpRateLimiter::new(1, Duration::from_millis(10));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(25));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_noop_dumper_declines() {
        let manager = DumpManager::new(Arc::new(NoopDumper), 5, Duration::from_secs(60));
        assert!(!manager.request(1234, "svc_host", "cpu over error limit"));
    }

    #[test]
    fn test_recent_dump_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("svc_1_20250101T000000.1"), b"x").unwrap();
        std::fs::write(dir.path().join("svc_2_20250101T000000.2"), b"x").unwrap();
        assert_eq!(recent_dump_count(dir.path(), Duration::from_secs(3600)), 2);
        assert_eq!(recent_dump_count(Path::new("/nonexistent"), Duration::from_secs(1)), 0);
    }
}
