//! # Observer Contract
//!
//! An observer is a scheduled unit of monitoring work with its own
//! settings, threshold configuration, and reporting domain. The runner
//! drives observers sequentially; an observer may parallelize internally
//! but must return promptly once its pass completes or its cancellation
//! token fires.
//!
//! [`ObserverRuntime`] carries the bookkeeping every observer shares:
//! enablement, cadence, last-run time, pass statistics, and the sticky
//! unhealthy flag the runner sets when an observer exceeds its hard
//! timeout. An unhealthy observer is quarantined - skipped on every
//! subsequent pass for the remainder of the process lifetime.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ObserverSettings;
use crate::evaluator::PassStats;
use crate::Result;

/// A scheduled unit of monitoring work.
#[async_trait]
pub trait Observer: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    /// Minimum interval between passes.
    fn run_interval(&self) -> Duration;

    /// Hard per-pass timeout the runner enforces; exceeding it
    /// quarantines the observer.
    fn run_timeout(&self) -> Duration;

    fn last_run_at(&self) -> Option<Instant>;

    /// Sticky quarantine flag, set by the runner on timeout.
    fn is_unhealthy(&self) -> bool;

    fn mark_unhealthy(&self);

    /// Warn/error totals of the most recent pass.
    fn last_pass_stats(&self) -> PassStats;

    /// Run one pass. Sequential within the runner; may parallelize
    /// internally. Must observe `ctx` and return promptly on cancellation.
    async fn observe(&self, ctx: &CancellationToken) -> Result<()>;

    /// Replace this observer's settings during an in-place configuration
    /// reload.
    async fn apply_settings(&self, settings: ObserverSettings) -> Result<()>;

    /// Emit one compensating Ok report per outstanding non-Ok health
    /// event this observer has authored. Called by the runner on
    /// shutdown; returns the number of reports emitted.
    fn retire_outstanding(&self, reason: &str) -> usize;

    /// Due when enabled, not quarantined, and the interval has elapsed
    /// since the last pass started.
    fn is_due(&self, now: Instant) -> bool {
        if !self.enabled() || self.is_unhealthy() {
            return false;
        }
        match self.last_run_at() {
            None => true,
            Some(last) => now.duration_since(last) >= self.run_interval(),
        }
    }
}

#[derive(Debug, Clone)]
struct RuntimeState {
    enabled: bool,
    run_interval: Duration,
    last_run_at: Option<Instant>,
    is_unhealthy: bool,
    last_stats: PassStats,
}

/// Shared per-observer bookkeeping.
#[derive(Debug)]
pub struct ObserverRuntime {
    name: String,
    state: RwLock<RuntimeState>,
}

impl ObserverRuntime {
    pub fn new(name: impl Into<String>, settings: &ObserverSettings) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(RuntimeState {
                enabled: settings.enabled,
                run_interval: settings.run_interval(),
                last_run_at: None,
                is_unhealthy: false,
                last_stats: PassStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn run_interval(&self) -> Duration {
        self.state.read().run_interval
    }

    pub fn last_run_at(&self) -> Option<Instant> {
        self.state.read().last_run_at
    }

    pub fn is_unhealthy(&self) -> bool {
        self.state.read().is_unhealthy
    }

    /// Quarantine is one-way; nothing resets it within a process.
    pub fn mark_unhealthy(&self) {
        self.state.write().is_unhealthy = true;
    }

    pub fn last_stats(&self) -> PassStats {
        self.state.read().last_stats
    }

    pub fn mark_run_started(&self) {
        self.state.write().last_run_at = Some(Instant::now());
    }

    pub fn record_pass(&self, stats: PassStats) {
        self.state.write().last_stats = stats;
    }

    /// Take new cadence/enablement from reloaded settings. The unhealthy
    /// flag is deliberately untouched.
    pub fn apply_settings(&self, settings: &ObserverSettings) {
        let mut state = self.state.write();
        state.enabled = settings.enabled;
        state.run_interval = settings.run_interval();
    }
}
