//! # System Services Observer
//!
//! Watches the platform's own service processes on this node - a fixed,
//! configurable list of process names rather than deployed applications.
//! Each watched process runs through the same sample-evaluate-report
//! pipeline as application targets, using a single threshold spec applied
//! to every watched name. A threshold side that is not configured is
//! simply never evaluated; a warn-only configuration can never raise an
//! Error.
//!
//! Independently of thresholds, every pass captures one Ok-level
//! informational aggregate event with point-in-time totals (CPU percent,
//! working set, handles, threads, active TCP ports) across all watched
//! services, giving downstream dashboards a per-node baseline of what the
//! platform itself consumes.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AgentSettings, ObserverSettings, TargetSpec, TargetThresholds};
use crate::dump::DumpManager;
use crate::evaluator::{EntityScope, Evaluator, PassStats};
use crate::health::{EntityKind, HealthEvent, HealthReporter, HealthState, HealthStore};
use crate::observer::{Observer, ObserverRuntime};
use crate::os_probe::OsProbe;
use crate::process_tree::ProcessTreeDiscovery;
use crate::resource_sampler::{MetricMaps, ResourceSampler};
use crate::target_resolver::{ServiceTarget, SYSTEM_APP_URI};
use crate::telemetry::TelemetrySink;
use crate::Result;

pub const SYSTEM_OBSERVER_NAME: &str = "SystemObserver";

/// Point-in-time totals across all watched system services.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SystemServicesSnapshot {
    pub service_count: usize,
    pub cpu_pct_total: f64,
    pub working_set_mb_total: f64,
    pub handles_total: i64,
    pub threads_total: i64,
    pub active_tcp_ports_total: i64,
}

pub struct SystemObserver {
    runtime: ObserverRuntime,
    settings: RwLock<ObserverSettings>,
    probe: Arc<dyn OsProbe>,
    tree: Arc<dyn ProcessTreeDiscovery>,
    reporter: Arc<HealthReporter>,
    sink: Arc<dyn TelemetrySink>,
    dumps: Arc<DumpManager>,
    maps: MetricMaps,
}

impl SystemObserver {
    pub fn new(
        agent: &AgentSettings,
        probe: Arc<dyn OsProbe>,
        tree: Arc<dyn ProcessTreeDiscovery>,
        store: Arc<dyn HealthStore>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let settings = agent.system_observer.clone();
        Self {
            runtime: ObserverRuntime::new(SYSTEM_OBSERVER_NAME, &settings),
            dumps: Arc::new(DumpManager::from_settings(&settings)),
            settings: RwLock::new(settings),
            probe,
            tree,
            reporter: Arc::new(HealthReporter::new(agent.node_name.clone(), store, sink.clone())),
            sink,
            maps: MetricMaps::new(),
        }
    }

    /// Pseudo-targets for every live process matching a watched name.
    fn resolve_system_targets(&self, settings: &ObserverSettings) -> Vec<ServiceTarget> {
        let thresholds: TargetThresholds = settings
            .system_target
            .as_ref()
            .map(TargetSpec::thresholds)
            .unwrap_or_default();

        let mut targets = Vec::new();
        for name in &settings.system_service_names {
            for proc in self.tree.find_processes_by_name(name) {
                let children = if settings.monitor_descendants {
                    self.tree.children(proc.pid)
                } else {
                    Vec::new()
                };
                targets.push(ServiceTarget {
                    app_name: SYSTEM_APP_URI.to_string(),
                    app_type_name: "System".to_string(),
                    service_name: format!("{SYSTEM_APP_URI}/{name}"),
                    service_type_name: name.clone(),
                    replica_or_instance_id: proc.pid as i64,
                    partition_id: uuid::Uuid::nil(),
                    host_pid: proc.pid,
                    host_process_name: proc.name.clone(),
                    host_process_start_time: proc.start_time,
                    children,
                    rg_memory_limit_mb: None,
                    rg_enabled: false,
                    thresholds: thresholds.clone(),
                });
            }
        }
        targets
    }

    /// Direct point reads for the aggregate snapshot; independent of the
    /// threshold pipeline so the baseline exists even with no thresholds
    /// configured.
    fn capture_snapshot(&self, targets: &[ServiceTarget]) -> SystemServicesSnapshot {
        let mut snapshot = SystemServicesSnapshot {
            service_count: targets.len(),
            ..SystemServicesSnapshot::default()
        };
        for target in targets {
            let pid = target.host_pid;
            // Warm-up then read; a vanished process contributes nothing.
            let _ = self.probe.cpu_percent(pid);
            let cpu = self.probe.cpu_percent(pid);
            if cpu >= 0.0 {
                snapshot.cpu_pct_total += cpu;
            }
            snapshot.working_set_mb_total +=
                self.probe.working_set_mb(pid, Some(&target.host_process_name), false);
            let handles = self.probe.handle_count(pid);
            if handles > 0 {
                snapshot.handles_total += handles;
            }
            snapshot.threads_total += self.probe.thread_count(pid);
            let ports = self.probe.active_tcp_port_count(pid);
            if ports > 0 {
                snapshot.active_tcp_ports_total += ports;
            }
        }
        snapshot
    }

    fn report_snapshot(&self, snapshot: &SystemServicesSnapshot, settings: &ObserverSettings) {
        let payload = serde_json::to_value(snapshot).unwrap_or_default();
        if let Err(e) = self.sink.emit_event("system_services_snapshot", payload) {
            debug!(error = %e, "snapshot telemetry dropped");
        }
        self.reporter.report(HealthEvent {
            node_name: self.reporter.node_name().to_string(),
            entity: EntityKind::Node,
            source_id: crate::health::source_id(SYSTEM_OBSERVER_NAME, "Snapshot"),
            property: "SystemServicesSnapshot".to_string(),
            state: HealthState::Ok,
            message: format!(
                "{} system services: cpu {:.1}%, working set {:.0} MB, {} handles, {} threads, {} tcp ports",
                snapshot.service_count,
                snapshot.cpu_pct_total,
                snapshot.working_set_mb_total,
                snapshot.handles_total,
                snapshot.threads_total,
                snapshot.active_tcp_ports_total,
            ),
            ttl: HealthReporter::ttl_for(settings.run_interval()),
            timestamp: chrono::Utc::now(),
            metric: None,
            value: None,
        });
    }
}

#[async_trait]
impl Observer for SystemObserver {
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
        self.settings.read().timeout()
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

    async fn observe(&self, ctx: &CancellationToken) -> Result<()> {
        if ctx.is_cancelled() {
            return Ok(());
        }
        self.runtime.mark_run_started();
        let settings = self.settings.read().clone();

        self.tree.snapshot();
        let targets = self.resolve_system_targets(&settings);
        if targets.is_empty() {
            debug!(observer = SYSTEM_OBSERVER_NAME, "no watched system services found");
            self.runtime.record_pass(PassStats::default());
            return Ok(());
        }

        let mut stats = PassStats::default();
        if targets.iter().any(|t| t.thresholds.any_enabled()) {
            let sampler =
                ResourceSampler::new(self.probe.clone(), self.tree.clone(), settings.clone());
            sampler.sample_targets(&targets, &self.maps, ctx).await;
            if ctx.is_cancelled() {
                return Ok(());
            }
            let evaluator = Evaluator::new(
                SYSTEM_OBSERVER_NAME,
                self.reporter.clone(),
                self.sink.clone(),
                self.dumps.clone(),
                EntityScope::Node,
                settings.run_interval(),
            );
            stats = evaluator.evaluate_targets(&targets, &self.maps);
        }
        self.runtime.record_pass(stats);

        let snapshot = self.capture_snapshot(&targets);
        self.report_snapshot(&snapshot, &settings);

        if settings.verbose_logging {
            info!(
                observer = SYSTEM_OBSERVER_NAME,
                services = snapshot.service_count,
                cpu_total = snapshot.cpu_pct_total,
                working_set_mb = snapshot.working_set_mb_total,
                warnings = stats.warnings,
                errors = stats.errors,
                "pass complete"
            );
        }
        Ok(())
    }

    async fn apply_settings(&self, settings: ObserverSettings) -> Result<()> {
        self.runtime.apply_settings(&settings);
        *self.settings.write() = settings;
        Ok(())
    }

    fn retire_outstanding(&self, reason: &str) -> usize {
        self.reporter.sweep_ok(reason)
    }
}
