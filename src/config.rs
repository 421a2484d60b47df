//! # Configuration - Agent Settings and Target Specifications
//!
//! Three layers of configuration feed the agent:
//!
//! 1. **Agent settings** ([`AgentSettings`]): node identity, runner loop
//!    cadence, per-observer settings. Loaded through the `config` crate
//!    from an optional settings file overlaid with `OBSERVER_`-prefixed
//!    environment variables (a `.env` file is honored when present).
//! 2. **Target specifications** ([`TargetSpec`]): the user's JSON array of
//!    monitored applications with per-target warn/error thresholds,
//!    exactly as documented for the application observer.
//! 3. **Derived thresholds** ([`TargetThresholds`]): the normalized
//!    per-metric view the evaluator consumes. A zero or absent limit means
//!    "not monitored" and never allocates a sampling buffer.
//!
//! Settings reload is in-place: the runner re-reads [`AgentSettings`] and
//! hands each observer its new [`ObserverSettings`] between passes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::{ObserverAgentError, Result};

/// Environment variable prefix for settings overrides
/// (`OBSERVER_NODE_NAME`, `OBSERVER_APP_OBSERVER__RUN_INTERVAL_SECS`, ...).
pub const ENV_PREFIX: &str = "OBSERVER";

/// Default settings file stem searched by [`AgentSettings::load`].
pub const SETTINGS_FILE: &str = "observer_settings";

/// The platform URI scheme applications are addressed with.
pub const APP_URI_SCHEME: &str = "fabric:";

/// Metric identities. `as_str` is the stable property stem used in health
/// event keys and telemetry, so renaming a variant is a breaking change to
/// downstream consumers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MetricKind {
    CpuTime,
    WorkingSetMb,
    WorkingSetPct,
    PrivateBytesMb,
    PrivateBytesPct,
    ActiveTcpPorts,
    EphemeralPorts,
    EphemeralPortsPct,
    FileHandles,
    Threads,
    RgMemoryPct,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::CpuTime => "CpuTime",
            MetricKind::WorkingSetMb => "WorkingSetMb",
            MetricKind::WorkingSetPct => "WorkingSetPct",
            MetricKind::PrivateBytesMb => "PrivateBytesMb",
            MetricKind::PrivateBytesPct => "PrivateBytesPct",
            MetricKind::ActiveTcpPorts => "ActiveTcpPorts",
            MetricKind::EphemeralPorts => "EphemeralPorts",
            MetricKind::EphemeralPortsPct => "EphemeralPortsPct",
            MetricKind::FileHandles => "FileHandles",
            MetricKind::Threads => "Threads",
            MetricKind::RgMemoryPct => "RgMemoryPct",
        }
    }

    /// Metrics sampled over the monitor window rather than as a single
    /// point read.
    pub fn is_windowed(&self) -> bool {
        matches!(
            self,
            MetricKind::CpuTime | MetricKind::WorkingSetMb | MetricKind::WorkingSetPct
        )
    }

    pub fn all() -> [MetricKind; 11] {
        [
            MetricKind::CpuTime,
            MetricKind::WorkingSetMb,
            MetricKind::WorkingSetPct,
            MetricKind::PrivateBytesMb,
            MetricKind::PrivateBytesPct,
            MetricKind::ActiveTcpPorts,
            MetricKind::EphemeralPorts,
            MetricKind::EphemeralPortsPct,
            MetricKind::FileHandles,
            MetricKind::Threads,
            MetricKind::RgMemoryPct,
        ]
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One warn/error threshold pair. A side that is absent (or configured as
/// zero) is never evaluated; a metric with both sides absent is not
/// monitored at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub warn: Option<f64>,
    pub error: Option<f64>,
}

impl ThresholdSet {
    /// Build from raw limits where `0` means unset.
    pub fn from_raw(warn: f64, error: f64) -> Self {
        Self {
            warn: (warn > 0.0).then_some(warn),
            error: (error > 0.0).then_some(error),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.warn.is_none() && self.error.is_none()
    }
}

/// The normalized per-target threshold view consumed by the sampler and
/// evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetThresholds {
    sets: BTreeMap<MetricKind, ThresholdSet>,
    pub dump_on_error: bool,
    pub dump_on_warning: bool,
    pub service_include: Vec<String>,
    pub service_exclude: Vec<String>,
    pub app_include: Vec<String>,
    pub app_exclude: Vec<String>,
}

impl TargetThresholds {
    pub fn set(&mut self, kind: MetricKind, thresholds: ThresholdSet) {
        if !thresholds.is_empty() {
            self.sets.insert(kind, thresholds);
        }
    }

    pub fn get(&self, kind: MetricKind) -> ThresholdSet {
        self.sets.get(&kind).copied().unwrap_or_default()
    }

    pub fn is_monitored(&self, kind: MetricKind) -> bool {
        !self.get(kind).is_empty()
    }

    /// Metrics with at least one configured side, in stable order.
    pub fn enabled_metrics(&self) -> impl Iterator<Item = MetricKind> + '_ {
        self.sets.keys().copied()
    }

    pub fn any_enabled(&self) -> bool {
        !self.sets.is_empty()
    }
}

/// Parse a comma-separated filter list into lowercase trimmed entries.
pub fn parse_filter_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// One entry of the application observer's JSON target list.
///
/// Field names match the documented configuration surface verbatim; all
/// limits default to `0` ("not monitored").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetSpec {
    pub target_app: Option<String>,
    pub target_app_type: Option<String>,

    pub app_include_list: Option<String>,
    pub app_exclude_list: Option<String>,
    pub service_include_list: Option<String>,
    pub service_exclude_list: Option<String>,

    pub cpu_error_limit_percent: f64,
    pub cpu_warning_limit_percent: f64,
    pub memory_error_limit_mb: f64,
    pub memory_warning_limit_mb: f64,
    pub memory_error_limit_percent: f64,
    pub memory_warning_limit_percent: f64,
    pub error_private_bytes_mb: f64,
    pub warning_private_bytes_mb: f64,
    pub error_private_bytes_percent: f64,
    pub warning_private_bytes_percent: f64,
    pub network_error_active_ports: f64,
    pub network_warning_active_ports: f64,
    pub network_error_ephemeral_ports: f64,
    pub network_warning_ephemeral_ports: f64,
    pub network_error_ephemeral_ports_percent: f64,
    pub network_warning_ephemeral_ports_percent: f64,
    pub error_open_file_handles: f64,
    pub warning_open_file_handles: f64,
    pub error_thread_count: f64,
    pub warning_thread_count: f64,
    pub warning_rg_memory_limit_percent: f64,

    pub dump_process_on_error: bool,
    pub dump_process_on_warning: bool,
}

impl TargetSpec {
    /// True for the `*` / `all` wildcard entry (case-insensitive).
    pub fn is_wildcard(&self) -> bool {
        match self.target_app.as_deref().map(str::trim) {
            Some("*") => true,
            Some(s) => s.eq_ignore_ascii_case("all"),
            None => false,
        }
    }

    /// True when any threshold side is configured.
    pub fn has_any_threshold(&self) -> bool {
        self.thresholds().any_enabled()
    }

    /// True when any include/exclude filter is configured. Used by the
    /// resolver's multi-config tie-break.
    pub fn has_any_filter(&self) -> bool {
        [
            &self.app_include_list,
            &self.app_exclude_list,
            &self.service_include_list,
            &self.service_exclude_list,
        ]
        .iter()
        .any(|l| l.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false))
    }

    /// Normalized threshold view for the evaluator.
    pub fn thresholds(&self) -> TargetThresholds {
        let mut t = TargetThresholds {
            dump_on_error: self.dump_process_on_error,
            dump_on_warning: self.dump_process_on_warning,
            service_include: parse_filter_list(self.service_include_list.as_deref()),
            service_exclude: parse_filter_list(self.service_exclude_list.as_deref()),
            app_include: parse_filter_list(self.app_include_list.as_deref()),
            app_exclude: parse_filter_list(self.app_exclude_list.as_deref()),
            ..TargetThresholds::default()
        };
        t.set(
            MetricKind::CpuTime,
            ThresholdSet::from_raw(self.cpu_warning_limit_percent, self.cpu_error_limit_percent),
        );
        t.set(
            MetricKind::WorkingSetMb,
            ThresholdSet::from_raw(self.memory_warning_limit_mb, self.memory_error_limit_mb),
        );
        t.set(
            MetricKind::WorkingSetPct,
            ThresholdSet::from_raw(
                self.memory_warning_limit_percent,
                self.memory_error_limit_percent,
            ),
        );
        t.set(
            MetricKind::PrivateBytesMb,
            ThresholdSet::from_raw(self.warning_private_bytes_mb, self.error_private_bytes_mb),
        );
        t.set(
            MetricKind::PrivateBytesPct,
            ThresholdSet::from_raw(
                self.warning_private_bytes_percent,
                self.error_private_bytes_percent,
            ),
        );
        t.set(
            MetricKind::ActiveTcpPorts,
            ThresholdSet::from_raw(
                self.network_warning_active_ports,
                self.network_error_active_ports,
            ),
        );
        t.set(
            MetricKind::EphemeralPorts,
            ThresholdSet::from_raw(
                self.network_warning_ephemeral_ports,
                self.network_error_ephemeral_ports,
            ),
        );
        t.set(
            MetricKind::EphemeralPortsPct,
            ThresholdSet::from_raw(
                self.network_warning_ephemeral_ports_percent,
                self.network_error_ephemeral_ports_percent,
            ),
        );
        t.set(
            MetricKind::FileHandles,
            ThresholdSet::from_raw(self.warning_open_file_handles, self.error_open_file_handles),
        );
        t.set(
            MetricKind::Threads,
            ThresholdSet::from_raw(self.warning_thread_count, self.error_thread_count),
        );
        t.set(
            MetricKind::RgMemoryPct,
            ThresholdSet::from_raw(self.warning_rg_memory_limit_percent, 0.0),
        );
        t
    }

    /// Fill this spec's unset fields from a wildcard entry. Specific
    /// settings always win; only zero/empty fields are taken from the
    /// wildcard.
    pub fn merge_from_wildcard(&mut self, wildcard: &TargetSpec) {
        macro_rules! fill_num {
            ($this:ident, $wild:ident, $($field:ident),*) => {
                $(if $this.$field == 0.0 { $this.$field = $wild.$field; })*
            };
        }
        macro_rules! fill_opt {
            ($this:ident, $wild:ident, $($field:ident),*) => {
                $(if $this.$field.as_deref().map(|s| s.trim().is_empty()).unwrap_or(true) {
                    $this.$field = $wild.$field.clone();
                })*
            };
        }
        fill_num!(
            self,
            wildcard,
            cpu_error_limit_percent,
            cpu_warning_limit_percent,
            memory_error_limit_mb,
            memory_warning_limit_mb,
            memory_error_limit_percent,
            memory_warning_limit_percent,
            error_private_bytes_mb,
            warning_private_bytes_mb,
            error_private_bytes_percent,
            warning_private_bytes_percent,
            network_error_active_ports,
            network_warning_active_ports,
            network_error_ephemeral_ports,
            network_warning_ephemeral_ports,
            network_error_ephemeral_ports_percent,
            network_warning_ephemeral_ports_percent,
            error_open_file_handles,
            warning_open_file_handles,
            error_thread_count,
            warning_thread_count,
            warning_rg_memory_limit_percent
        );
        fill_opt!(
            self,
            wildcard,
            app_include_list,
            app_exclude_list,
            service_include_list,
            service_exclude_list
        );
        if !self.dump_process_on_error {
            self.dump_process_on_error = wildcard.dump_process_on_error;
        }
        if !self.dump_process_on_warning {
            self.dump_process_on_warning = wildcard.dump_process_on_warning;
        }
    }

    /// Parse a JSON target list.
    pub fn parse_list(json: &str) -> Result<Vec<TargetSpec>> {
        serde_json::from_str(json).map_err(|e| {
            ObserverAgentError::Configuration(format!("target list JSON: {e}"))
        })
    }

    /// Load a JSON target list from disk.
    pub fn load_list(path: &Path) -> Result<Vec<TargetSpec>> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ObserverAgentError::Configuration(format!(
                "target list {}: {e}",
                path.display()
            ))
        })?;
        Self::parse_list(&raw)
    }
}

/// Per-observer settings shared by both complex observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverSettings {
    pub enabled: bool,
    /// Minimum interval between two passes of this observer.
    pub run_interval_secs: u64,
    /// Hard per-pass timeout enforced by the runner.
    pub timeout_secs: u64,
    /// Length of the CPU / working-set sampling window.
    pub monitor_duration_secs: u64,
    /// Delay between consecutive samples inside the window.
    pub sample_interval_ms: u64,
    /// Override for bounded sampling parallelism; `None` derives from the
    /// core count.
    pub max_parallel: Option<usize>,
    /// Expected sample count per window; sizes buffer allocation.
    pub buffer_capacity: usize,
    /// Use oldest-overwrite buffers instead of unbounded-within-a-pass.
    pub circular_buffers: bool,
    /// Emit per-sample debug logging.
    pub verbose_logging: bool,
    /// Monitor descendant processes of each host process.
    pub monitor_descendants: bool,
    /// Inline target list (application observer only); takes precedence
    /// over `target_list_path`.
    pub target_specs: Vec<TargetSpec>,
    /// Path of the JSON target list (application observer only).
    pub target_list_path: Option<String>,
    /// Watched process names (system-services observer only).
    pub system_service_names: Vec<String>,
    /// Warn thresholds for system services, as a bare spec applied to
    /// every watched name (system-services observer only).
    pub system_target: Option<TargetSpec>,
    /// Directory for process dumps requested on threshold breach.
    pub dump_dir: Option<String>,
    /// Dump budget per window.
    pub max_dumps: u32,
    pub max_dumps_window_secs: u64,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            run_interval_secs: 60,
            timeout_secs: 600,
            monitor_duration_secs: 1,
            sample_interval_ms: 250,
            max_parallel: None,
            buffer_capacity: 16,
            circular_buffers: false,
            verbose_logging: false,
            monitor_descendants: true,
            target_specs: Vec::new(),
            target_list_path: None,
            system_service_names: default_system_services(),
            system_target: None,
            dump_dir: None,
            max_dumps: 3,
            max_dumps_window_secs: 24 * 60 * 60, // one dump budget per day
        }
    }
}

impl ObserverSettings {
    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn monitor_duration(&self) -> Duration {
        Duration::from_secs(self.monitor_duration_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

fn default_system_services() -> Vec<String> {
    [
        "cluster-runtime",
        "cluster-gateway",
        "cluster-hosting",
        "cluster-diagnostics",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Top-level agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// This node's name as known to the cluster.
    pub node_name: String,
    /// Sleep between runner iterations. Floored to 15 s when only one
    /// observer is enabled.
    pub loop_sleep_secs: u64,
    /// Restart the whole process on configuration update instead of
    /// reloading in place (platform strategy chosen at startup).
    pub restart_on_config_update: bool,
    /// Same-named-process count past which the working-set probe takes
    /// the direct-pid path.
    pub working_set_fast_path_threshold: usize,
    /// Emit the once-per-day operational telemetry snapshot.
    pub operational_telemetry: bool,
    /// URL of the upstream version manifest checked once per day; empty
    /// disables the check.
    pub version_check_url: String,
    /// Install the Prometheus recorder for the agent's own metrics.
    pub prometheus_recorder: bool,
    /// Directory for the daily-rolling agent log; unset keeps console
    /// output only.
    pub log_dir: Option<String>,
    /// Emit JSON log lines instead of human-readable ones.
    pub log_json: bool,
    /// Report level used for observer-health events (true = Error,
    /// false = Warning).
    pub observer_failure_is_error: bool,

    pub app_observer: ObserverSettings,
    pub system_observer: ObserverSettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            loop_sleep_secs: 30,
            restart_on_config_update: false,
            working_set_fast_path_threshold: crate::os_probe::DEFAULT_FAST_PATH_THRESHOLD,
            operational_telemetry: true,
            version_check_url: String::new(),
            prometheus_recorder: false,
            log_dir: None,
            log_json: false,
            observer_failure_is_error: false,
            app_observer: ObserverSettings::default(),
            system_observer: ObserverSettings {
                run_interval_secs: 300,
                ..ObserverSettings::default()
            },
        }
    }
}

impl AgentSettings {
    /// Load settings: defaults, overlaid by `observer_settings.{toml,json,
    /// yaml}` when present, overlaid by `OBSERVER_*` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(SETTINGS_FILE)
    }

    /// Load with an explicit settings file stem (extension negotiated by
    /// the `config` crate).
    pub fn load_from(file_stem: &str) -> Result<Self> {
        // A missing .env is fine; an unreadable one is not worth dying for.
        let _ = dotenvy::dotenv();

        let built = config::Config::builder()
            .add_source(config::File::with_name(file_stem).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ObserverAgentError::Configuration(e.to_string()))?;

        built
            .try_deserialize()
            .map_err(|e| ObserverAgentError::Configuration(e.to_string()))
    }

    pub fn loop_sleep(&self, enabled_observers: usize) -> Duration {
        let floor = if enabled_observers <= 1 { 15 } else { 0 };
        Duration::from_secs(self.loop_sleep_secs.max(floor))
    }
}
