//! # Application Observer
//!
//! The user-facing observer: takes the JSON-configured target list,
//! resolves it against the applications deployed on this node, samples
//! each target's process family, evaluates thresholds, and reports.
//!
//! One pass is one trip through the full pipeline:
//!
//! 1. Load target specs (inline settings first, then the configured JSON
//!    file). A missing or malformed list raises a node-level Warning and
//!    ends the pass without sampling.
//! 2. Resolve specs to concrete targets via [`TargetResolver`].
//! 3. Sample all targets with bounded parallelism via [`ResourceSampler`].
//! 4. Evaluate thresholds and report via [`Evaluator`]; record the pass
//!    totals on the observer runtime.
//!
//! The observer owns its metric maps across passes so buffers flagged
//! with an active warning or error survive for hysteresis; everything
//! else is rebuilt each pass.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster_query::ClusterQuery;
use crate::config::{AgentSettings, ObserverSettings, TargetSpec};
use crate::dump::DumpManager;
use crate::evaluator::{EntityScope, Evaluator, PassStats};
use crate::health::{HealthReporter, HealthState, HealthStore};
use crate::observer::{Observer, ObserverRuntime};
use crate::os_probe::OsProbe;
use crate::process_tree::ProcessTreeDiscovery;
use crate::resource_sampler::{MetricMaps, ResourceSampler};
use crate::target_resolver::TargetResolver;
use crate::telemetry::TelemetrySink;
use crate::{ObserverAgentError, Result};

pub const APP_OBSERVER_NAME: &str = "AppObserver";

pub struct AppObserver {
    runtime: ObserverRuntime,
    settings: RwLock<ObserverSettings>,
    cluster: Arc<dyn ClusterQuery>,
    probe: Arc<dyn OsProbe>,
    tree: Arc<dyn ProcessTreeDiscovery>,
    reporter: Arc<HealthReporter>,
    sink: Arc<dyn TelemetrySink>,
    dumps: Arc<DumpManager>,
    maps: MetricMaps,
    /// Process names belonging to the platform runtime itself; replicas
    /// hosted by these are never monitored.
    platform_process_names: Vec<String>,
}

impl AppObserver {
    pub fn new(
        agent: &AgentSettings,
        cluster: Arc<dyn ClusterQuery>,
        probe: Arc<dyn OsProbe>,
        tree: Arc<dyn ProcessTreeDiscovery>,
        store: Arc<dyn HealthStore>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let settings = agent.app_observer.clone();
        Self {
            runtime: ObserverRuntime::new(APP_OBSERVER_NAME, &settings),
            dumps: Arc::new(DumpManager::from_settings(&settings)),
            settings: RwLock::new(settings),
            cluster,
            probe,
            tree,
            reporter: Arc::new(HealthReporter::new(agent.node_name.clone(), store, sink.clone())),
            sink,
            maps: MetricMaps::new(),
            platform_process_names: agent.system_observer.system_service_names.clone(),
        }
    }

    /// Load the pass's target specs: inline settings win, then the JSON
    /// file. `Err` carries a configuration fault the pass surfaces as a
    /// node Warning.
    fn load_specs(&self, settings: &ObserverSettings) -> Result<Vec<TargetSpec>> {
        if !settings.target_specs.is_empty() {
            return Ok(settings.target_specs.clone());
        }
        match &settings.target_list_path {
            Some(path) => TargetSpec::load_list(Path::new(path)),
            None => Err(ObserverAgentError::Configuration(
                "no target list configured for the application observer".to_string(),
            )),
        }
    }

    fn report_config_fault(&self, settings: &ObserverSettings, error: &ObserverAgentError) {
        warn!(observer = APP_OBSERVER_NAME, error = %error, "configuration fault; pass skipped");
        self.reporter.node_report(
            APP_OBSERVER_NAME,
            "Config",
            "TargetList",
            HealthState::Warning,
            error.to_string(),
            HealthReporter::ttl_for(settings.run_interval()),
        );
    }

    /// A healthy configuration retires any previously raised config
    /// warning.
    fn clear_config_fault(&self, settings: &ObserverSettings) {
        let key = crate::health::HealthKey {
            entity: crate::health::EntityKind::Node,
            source_id: crate::health::source_id(APP_OBSERVER_NAME, "Config"),
            property: "TargetList".to_string(),
        };
        if self.reporter.current_state(&key) != HealthState::Ok {
            self.reporter.node_report(
                APP_OBSERVER_NAME,
                "Config",
                "TargetList",
                HealthState::Ok,
                "target list configuration is valid again",
                HealthReporter::ttl_for(settings.run_interval()),
            );
        }
    }
}

#[async_trait]
impl Observer for AppObserver {
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
        let pass_started = Instant::now();

        let specs = match self.load_specs(&settings) {
            Ok(specs) => {
                self.clear_config_fault(&settings);
                specs
            }
            Err(e) => {
                self.report_config_fault(&settings, &e);
                return Ok(());
            }
        };

        let resolver = TargetResolver::new(
            APP_OBSERVER_NAME,
            self.cluster.clone(),
            self.tree.clone(),
            self.reporter.clone(),
            self.platform_process_names.clone(),
            settings.monitor_descendants,
        );
        let targets = match resolver.resolve(&specs).await {
            Ok(targets) => targets,
            Err(e) => {
                // A cluster that cannot be queried is a transient fault;
                // the next pass retries.
                warn!(observer = APP_OBSERVER_NAME, error = %e, "target resolution failed; pass skipped");
                return Ok(());
            }
        };
        if targets.is_empty() {
            debug!(observer = APP_OBSERVER_NAME, "no targets resolved this pass");
            self.runtime.record_pass(PassStats::default());
            return Ok(());
        }

        let sampler = ResourceSampler::new(self.probe.clone(), self.tree.clone(), settings.clone());
        let sampled = sampler.sample_targets(&targets, &self.maps, ctx).await;
        if ctx.is_cancelled() {
            // Cancelled mid-pass: leave the health store untouched.
            return Ok(());
        }

        let evaluator = Evaluator::new(
            APP_OBSERVER_NAME,
            self.reporter.clone(),
            self.sink.clone(),
            self.dumps.clone(),
            EntityScope::Node,
            settings.run_interval(),
        );
        let stats = evaluator.evaluate_targets(&targets, &self.maps);
        self.runtime.record_pass(stats);

        if settings.verbose_logging {
            info!(
                observer = APP_OBSERVER_NAME,
                targets = targets.len(),
                sampled,
                evaluated = stats.evaluated,
                warnings = stats.warnings,
                errors = stats.errors,
                elapsed_ms = pass_started.elapsed().as_millis() as u64,
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
