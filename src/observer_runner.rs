//! # Observer Runner - The Agent's Scheduler
//!
//! One cooperative loop per process. Observers execute sequentially, each
//! under a hard timeout and a cancellation token linked to the runner's
//! root token; between iterations the runner sleeps, emits low-frequency
//! operational telemetry, and handles shutdown and configuration updates.
//!
//! ## State Machine
//!
//! - **Running**: drive every due observer in configured order. A pass
//!   that exceeds its timeout quarantines the observer for the remainder
//!   of the process lifetime and raises an observer-health report. A
//!   privilege-loss error escalates out of `run` so the supervisor can
//!   restart the process with capabilities re-applied; memory exhaustion
//!   escalates after a critical telemetry event. Every other error is
//!   logged and absorbed.
//! - **Configuration update**: with the restart strategy selected,
//!   `run` returns [`RunnerExit::RestartRequested`]. Otherwise the runner
//!   cancels the in-flight observer, applies the new settings to each
//!   observer in place, rebuilds the linked cancellation token, and
//!   resumes.
//! - **Shutdown**: stop iterating, cancel the current observer, then emit
//!   one compensating Ok report per outstanding non-Ok health event this
//!   process has authored.
//!
//! The once-per-day duties - the operational telemetry snapshot and the
//! upstream version check - run between iterations and only while the
//! shutdown token is untriggered.

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AgentSettings, APP_URI_SCHEME};
use crate::health::{HealthReporter, HealthState, HealthStore};
use crate::observer::Observer;
use crate::telemetry::TelemetrySink;
use crate::{ObserverAgentError, Result};

const OPS_TELEMETRY_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    /// The shutdown token fired; outstanding reports were retired.
    ShutdownRequested,
    /// A configuration update arrived under the restart strategy; the
    /// embedding process should exit and be restarted by its supervisor.
    RestartRequested,
}

/// Cloneable control surface over a running agent.
#[derive(Clone)]
pub struct RunnerHandle {
    root: CancellationToken,
    pending: Arc<Mutex<Option<AgentSettings>>>,
    interrupt: Arc<RwLock<CancellationToken>>,
}

impl RunnerHandle {
    /// Request graceful shutdown: the in-flight observer is cancelled and
    /// outstanding health reports are retired before `run` returns.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Deliver a configuration update. The in-flight observer is
    /// cancelled; the runner applies the settings between passes (or
    /// returns [`RunnerExit::RestartRequested`] under the restart
    /// strategy).
    pub fn update_config(&self, settings: AgentSettings) {
        *self.pending.lock() = Some(settings);
        self.interrupt.read().cancel();
    }
}

pub struct ObserverRunner {
    settings: AgentSettings,
    observers: Vec<Box<dyn Observer>>,
    reporter: Arc<HealthReporter>,
    sink: Arc<dyn TelemetrySink>,
    root: CancellationToken,
    interrupt: Arc<RwLock<CancellationToken>>,
    pending: Arc<Mutex<Option<AgentSettings>>>,
    config_update_in_progress: AtomicBool,
    last_ops_emit: Mutex<Option<Instant>>,
    started_at: Instant,
    run_id: uuid::Uuid,
}

impl ObserverRunner {
    pub fn new(
        settings: AgentSettings,
        observers: Vec<Box<dyn Observer>>,
        store: Arc<dyn HealthStore>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let root = CancellationToken::new();
        let interrupt = Arc::new(RwLock::new(root.child_token()));
        Self {
            reporter: Arc::new(HealthReporter::new(
                settings.node_name.clone(),
                store,
                sink.clone(),
            )),
            settings,
            observers,
            sink,
            interrupt,
            pending: Arc::new(Mutex::new(None)),
            config_update_in_progress: AtomicBool::new(false),
            last_ops_emit: Mutex::new(None),
            started_at: Instant::now(),
            run_id: uuid::Uuid::new_v4(),
            root,
        }
    }

    /// Control surface for the embedding program (signal handlers,
    /// configuration watchers).
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            root: self.root.clone(),
            pending: self.pending.clone(),
            interrupt: self.interrupt.clone(),
        }
    }

    pub fn observers(&self) -> &[Box<dyn Observer>] {
        &self.observers
    }

    pub fn is_config_update_in_progress(&self) -> bool {
        self.config_update_in_progress.load(Ordering::Relaxed)
    }

    /// The scheduler loop. Returns on shutdown, restart-style config
    /// update, or a fatal (escalating) error.
    pub async fn run(&mut self) -> Result<RunnerExit> {
        info!(
            run_id = %self.run_id,
            observers = self.observers.len(),
            node = %self.settings.node_name,
            "observer runner starting"
        );
        let _ = self.sink.emit_event(
            "runner_started",
            json!({
                "run_id": self.run_id.to_string(),
                "version": crate::AGENT_VERSION,
                "observers": self.observers.iter().map(|o| o.name()).collect::<Vec<_>>(),
                "uri_scheme": APP_URI_SCHEME,
            }),
        );

        loop {
            if self.root.is_cancelled() {
                return Ok(self.finish_shutdown());
            }

            for i in 0..self.observers.len() {
                if self.root.is_cancelled() {
                    return Ok(self.finish_shutdown());
                }
                if let Some(exit) = self.apply_pending_config().await? {
                    return Ok(exit);
                }
                if !self.observers[i].is_due(Instant::now()) {
                    continue;
                }
                self.drive_observer(i).await?;
            }

            if let Some(exit) = self.apply_pending_config().await? {
                return Ok(exit);
            }
            if !self.root.is_cancelled() {
                self.maybe_emit_daily_ops().await;
            }

            let enabled = self.observers.iter().filter(|o| o.enabled()).count();
            let interrupt = self.interrupt.read().clone();
            tokio::select! {
                _ = self.root.cancelled() => return Ok(self.finish_shutdown()),
                // A configuration update cancels the interrupt token; wake
                // up and let the next iteration apply it.
                _ = interrupt.cancelled() => {}
                _ = tokio::time::sleep(self.settings.loop_sleep(enabled)) => {}
            }
        }
    }

    /// Run one observer under its timeout, classifying the outcome.
    async fn drive_observer(&self, index: usize) -> Result<()> {
        let observer = &self.observers[index];
        let name = observer.name().to_string();
        let timeout = observer.run_timeout();
        let ctx = self.interrupt.read().child_token();

        let started = Instant::now();
        match tokio::time::timeout(timeout, observer.observe(&ctx)).await {
            Err(_elapsed) => {
                ctx.cancel();
                observer.mark_unhealthy();
                let state = if self.settings.observer_failure_is_error {
                    HealthState::Error
                } else {
                    HealthState::Warning
                };
                error!(
                    observer = %name,
                    timeout_secs = timeout.as_secs(),
                    "observer exceeded its run timeout and is quarantined for the process lifetime"
                );
                self.reporter.node_report(
                    &name,
                    "ObserverHealth",
                    format!("ObserverHealth:{name}"),
                    state,
                    format!(
                        "observer did not complete within {}s and has been disabled until restart",
                        timeout.as_secs()
                    ),
                    OPS_TELEMETRY_INTERVAL,
                );
                let _ = self.sink.emit_event(
                    "observer_timeout",
                    json!({ "observer": name, "timeout_secs": timeout.as_secs() }),
                );
            }
            Ok(Err(e)) if e.is_fatal() => {
                let _ = self.sink.emit_event(
                    "fatal_error",
                    json!({ "observer": name, "error": e.to_string() }),
                );
                error!(observer = %name, error = %e, "fatal error; escalating for process restart");
                return Err(e);
            }
            Ok(Err(e)) => {
                warn!(observer = %name, error = %e, "observer pass failed; continuing");
                let _ = self.sink.emit_event(
                    "observer_error",
                    json!({ "observer": name, "error": e.to_string() }),
                );
            }
            Ok(Ok(())) => {
                let stats = observer.last_pass_stats();
                info!(
                    observer = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    warnings = stats.warnings,
                    errors = stats.errors,
                    "observer pass finished"
                );
            }
        }
        Ok(())
    }

    /// Apply a delivered configuration update, if any.
    async fn apply_pending_config(&mut self) -> Result<Option<RunnerExit>> {
        let Some(new_settings) = self.pending.lock().take() else {
            return Ok(None);
        };

        if self.settings.restart_on_config_update {
            info!("configuration update received; restart strategy selected");
            let _ = self
                .sink
                .emit_event("config_restart_requested", json!({ "run_id": self.run_id.to_string() }));
            return Ok(Some(RunnerExit::RestartRequested));
        }

        self.config_update_in_progress.store(true, Ordering::Relaxed);
        info!("applying configuration update in place");

        // The interrupt token was cancelled by the handle to stop the
        // in-flight observer; hand out a fresh one before resuming.
        for observer in &self.observers {
            let per_observer = match observer.name() {
                crate::app_observer::APP_OBSERVER_NAME => new_settings.app_observer.clone(),
                crate::system_observer::SYSTEM_OBSERVER_NAME => {
                    new_settings.system_observer.clone()
                }
                _ => continue,
            };
            if let Err(e) = observer.apply_settings(per_observer).await {
                warn!(observer = observer.name(), error = %e, "settings update rejected");
            }
        }
        self.settings = new_settings;
        *self.interrupt.write() = self.root.child_token();

        self.config_update_in_progress.store(false, Ordering::Relaxed);
        let _ = self
            .sink
            .emit_event("config_updated", json!({ "run_id": self.run_id.to_string() }));
        Ok(None)
    }

    /// Shutdown path: cancel everything in flight, retire every non-Ok
    /// report this process has authored.
    fn finish_shutdown(&self) -> RunnerExit {
        self.interrupt.read().cancel();
        let mut retired = self.reporter.sweep_ok("observer agent shutting down");
        for observer in &self.observers {
            retired += observer.retire_outstanding("observer agent shutting down");
        }
        info!(retired, "shutdown complete; outstanding health reports retired");
        let _ = self.sink.emit_event(
            "runner_stopped",
            json!({
                "run_id": self.run_id.to_string(),
                "retired_reports": retired,
                "uptime_secs": self.started_at.elapsed().as_secs(),
            }),
        );
        RunnerExit::ShutdownRequested
    }

    /// At most once per day: the operational snapshot and the upstream
    /// version check.
    async fn maybe_emit_daily_ops(&self) {
        if !self.settings.operational_telemetry {
            return;
        }
        {
            let last = self.last_ops_emit.lock();
            if let Some(at) = *last {
                if at.elapsed() < OPS_TELEMETRY_INTERVAL {
                    return;
                }
            }
        }
        *self.last_ops_emit.lock() = Some(Instant::now());

        let observers: Vec<serde_json::Value> = self
            .observers
            .iter()
            .map(|o| {
                let stats = o.last_pass_stats();
                json!({
                    "name": o.name(),
                    "enabled": o.enabled(),
                    "unhealthy": o.is_unhealthy(),
                    "warnings": stats.warnings,
                    "errors": stats.errors,
                })
            })
            .collect();
        let _ = self.sink.emit_event(
            "operational_snapshot",
            json!({
                "run_id": self.run_id.to_string(),
                "version": crate::AGENT_VERSION,
                "uptime_secs": self.started_at.elapsed().as_secs(),
                "outstanding_reports": self.reporter.outstanding_count(),
                "observers": observers,
            }),
        );

        if !self.settings.version_check_url.is_empty() {
            check_upstream_version(&self.settings.version_check_url).await;
        }
    }
}

/// Compare the published version manifest against this build; informative
/// only, every failure is swallowed.
async fn check_upstream_version(url: &str) {
    let client = match reqwest::Client::builder()
        .timeout(VERSION_CHECK_TIMEOUT)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "version check client unavailable");
            return;
        }
    };
    let latest = async {
        let body: serde_json::Value = client.get(url).send().await.ok()?.json().await.ok()?;
        body.get("version")?.as_str().map(str::to_string)
    }
    .await;

    match latest {
        Some(latest) if latest != crate::AGENT_VERSION => {
            info!(
                current = crate::AGENT_VERSION,
                latest = %latest,
                "a newer observer agent version is published"
            );
        }
        Some(_) => {}
        None => warn!(url, "version manifest unavailable or malformed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObserverSettings;
    use crate::evaluator::PassStats;
    use crate::health::HealthEvent;
    use crate::observer::ObserverRuntime;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingStore {
        events: Mutex<Vec<HealthEvent>>,
    }
    impl HealthStore for RecordingStore {
        fn emit(&self, event: HealthEvent) -> Result<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }
    impl TelemetrySink for RecordingSink {
        fn report_metric(&self, _: &crate::telemetry::MetricEvent) -> Result<()> {
            Ok(())
        }
        fn report_health(&self, _: &HealthEvent) -> Result<()> {
            Ok(())
        }
        fn emit_event(&self, name: &str, _: serde_json::Value) -> Result<()> {
            self.events.lock().push(name.to_string());
            Ok(())
        }
    }

    struct ScriptedObserver {
        runtime: ObserverRuntime,
        timeout: Duration,
        pass_delay: Duration,
        passes: Arc<AtomicUsize>,
        applied_intervals: Arc<Mutex<Vec<Duration>>>,
        fail_with: Option<ObserverAgentError>,
    }

    impl ScriptedObserver {
        fn quick(name: &str) -> Self {
            Self::new(name, Duration::from_secs(5), Duration::ZERO, None)
        }

        fn new(
            name: &str,
            timeout: Duration,
            pass_delay: Duration,
            fail_with: Option<ObserverAgentError>,
        ) -> Self {
            let settings = ObserverSettings {
                run_interval_secs: 3600, // one pass per test
                ..ObserverSettings::default()
            };
            Self {
                runtime: ObserverRuntime::new(name, &settings),
                timeout,
                pass_delay,
                passes: Arc::new(AtomicUsize::new(0)),
                applied_intervals: Arc::new(Mutex::new(Vec::new())),
                fail_with,
            }
        }
    }

    #[async_trait]
    impl Observer for ScriptedObserver {
        fn name(&self) -> &str {
            self.runtime.name()
        }
        fn enabled(&self) -> bool {
            self.runtime.enabled()
        }
        fn run_interval(&self) -> Duration {
            self.runtime.run_interval()
        }
        fn run_timeout(&self) -> Duration {
            self.timeout
        }
        fn last_run_at(&self) -> Option<Instant> {
            self.runtime.last_run_at()
        }
        fn is_unhealthy(&self) -> bool {
            self.runtime.is_unhealthy()
        }
        fn mark_unhealthy(&self) {
            self.runtime.mark_unhealthy()
        }
        fn last_pass_stats(&self) -> PassStats {
            self.runtime.last_stats()
        }
        async fn observe(&self, _ctx: &CancellationToken) -> Result<()> {
            self.runtime.mark_run_started();
            self.passes.fetch_add(1, Ordering::SeqCst);
            if !self.pass_delay.is_zero() {
                tokio::time::sleep(self.pass_delay).await;
            }
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
        async fn apply_settings(&self, settings: ObserverSettings) -> Result<()> {
            self.applied_intervals.lock().push(settings.run_interval());
            self.runtime.apply_settings(&settings);
            Ok(())
        }
        fn retire_outstanding(&self, _reason: &str) -> usize {
            0
        }
    }

    fn test_settings() -> AgentSettings {
        AgentSettings {
            loop_sleep_secs: 3600, // the select on shutdown ends the sleep
            operational_telemetry: false,
            ..AgentSettings::default()
        }
    }

    #[tokio::test]
    async fn test_runs_observers_then_shuts_down() {
        let observer = ScriptedObserver::quick("A");
        let passes = observer.passes.clone();
        let mut runner = ObserverRunner::new(
            test_settings(),
            vec![Box::new(observer), Box::new(ScriptedObserver::quick("B"))],
            Arc::new(RecordingStore::default()),
            Arc::new(RecordingSink::default()),
        );
        let handle = runner.handle();

        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();

        let exit = task.await.unwrap().unwrap();
        assert_eq!(exit, RunnerExit::ShutdownRequested);
        assert_eq!(passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_quarantines_observer() {
        let slow = ScriptedObserver::new(
            "Slow",
            Duration::from_millis(20),
            Duration::from_secs(60),
            None,
        );
        let store = Arc::new(RecordingStore::default());
        let mut runner = ObserverRunner::new(
            test_settings(),
            vec![Box::new(slow)],
            store.clone(),
            Arc::new(RecordingSink::default()),
        );
        let handle = runner.handle();

        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown();
        task.await.unwrap().unwrap();

        // The timeout raised an observer-health warning; the shutdown
        // sweep then retired it.
        let events = store.events.lock();
        assert!(events
            .iter()
            .any(|e| e.property == "ObserverHealth:Slow" && e.state == HealthState::Warning));
        assert!(events
            .iter()
            .any(|e| e.property == "ObserverHealth:Slow" && e.state == HealthState::Ok));
    }

    #[tokio::test]
    async fn test_privilege_loss_escalates() {
        let failing = ScriptedObserver::new(
            "Escalating",
            Duration::from_secs(5),
            Duration::ZERO,
            Some(ObserverAgentError::PrivilegeLoss("capability cleared".into())),
        );
        let mut runner = ObserverRunner::new(
            test_settings(),
            vec![Box::new(failing)],
            Arc::new(RecordingStore::default()),
            Arc::new(RecordingSink::default()),
        );

        let result = runner.run().await;
        assert!(matches!(result, Err(ObserverAgentError::PrivilegeLoss(_))));
    }

    #[tokio::test]
    async fn test_ordinary_error_is_absorbed() {
        let failing = ScriptedObserver::new(
            "Flaky",
            Duration::from_secs(5),
            Duration::ZERO,
            Some(ObserverAgentError::Transient("query hiccup".into())),
        );
        let sink = Arc::new(RecordingSink::default());
        let mut runner = ObserverRunner::new(
            test_settings(),
            vec![Box::new(failing)],
            Arc::new(RecordingStore::default()),
            sink.clone(),
        );
        let handle = runner.handle();

        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        let exit = task.await.unwrap().unwrap();

        assert_eq!(exit, RunnerExit::ShutdownRequested);
        assert!(sink.events.lock().iter().any(|e| e == "observer_error"));
    }

    #[tokio::test]
    async fn test_config_update_restart_strategy() {
        let settings = AgentSettings {
            restart_on_config_update: true,
            ..test_settings()
        };
        let mut runner = ObserverRunner::new(
            settings.clone(),
            vec![Box::new(ScriptedObserver::quick("A"))],
            Arc::new(RecordingStore::default()),
            Arc::new(RecordingSink::default()),
        );
        let handle = runner.handle();

        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.update_config(settings);

        let exit = task.await.unwrap().unwrap();
        assert_eq!(exit, RunnerExit::RestartRequested);
    }

    #[tokio::test]
    async fn test_config_update_in_place() {
        let observer = ScriptedObserver::quick(crate::app_observer::APP_OBSERVER_NAME);
        let applied = observer.applied_intervals.clone();
        let mut runner = ObserverRunner::new(
            test_settings(),
            vec![Box::new(observer)],
            Arc::new(RecordingStore::default()),
            Arc::new(RecordingSink::default()),
        );
        let handle = runner.handle();

        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut updated = test_settings();
        updated.app_observer.run_interval_secs = 1234;
        handle.update_config(updated);
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        let exit = task.await.unwrap().unwrap();

        assert_eq!(exit, RunnerExit::ShutdownRequested);
        assert_eq!(
            applied.lock().as_slice(),
            &[Duration::from_secs(1234)],
            "the reloaded interval reached the observer"
        );
    }
}
