//! # Telemetry - Structured Emission for Downstream Ingestion
//!
//! Every observer pass produces two kinds of records: metric events (one
//! per evaluated family value, emitted regardless of threshold state) and
//! health events (one per state transition). Both flow through the
//! [`TelemetrySink`] contract so concrete backends stay out of the engine.
//!
//! Provided sinks:
//!
//! - [`LogTelemetrySink`]: structured `tracing` emission plus gauges on
//!   the `metrics` facade, for scrape-based collection.
//! - [`FileTelemetrySink`]: append-only JSON lines on local disk, the
//!   at-rest form picked up by log shippers.
//! - [`CompositeTelemetrySink`]: fan-out to several sinks; a failing sink
//!   is logged and skipped, never aborting the others.
//!
//! [`init_telemetry`] installs the global tracing subscriber (console and
//! optional daily-rolling file layer) exactly once per process, and
//! optionally installs the Prometheus recorder for the agent's own
//! internal metrics.

use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::MetricKind;
use crate::health::HealthEvent;
use crate::{ObserverAgentError, Result};

static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// One family-value measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    pub node_name: String,
    pub observer: String,
    pub app_name: String,
    pub service_name: String,
    pub target_id: String,
    pub metric: MetricKind,
    pub value: f64,
    pub pid: u32,
    /// Number of descendant processes folded into the value.
    pub child_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Narrow, plug-replaceable telemetry contract.
///
/// Implementations must be safe under concurrent use and should complete
/// quickly (queue internally if the backend is slow); callers log and
/// continue on failure.
pub trait TelemetrySink: Send + Sync {
    fn report_metric(&self, event: &MetricEvent) -> Result<()>;
    fn report_health(&self, event: &HealthEvent) -> Result<()>;
    /// Free-form operational events (runner lifecycle, daily snapshot).
    fn emit_event(&self, name: &str, payload: serde_json::Value) -> Result<()>;
}

/// Tracing + metrics-facade sink.
pub struct LogTelemetrySink;

impl TelemetrySink for LogTelemetrySink {
    fn report_metric(&self, event: &MetricEvent) -> Result<()> {
        info!(
            observer = %event.observer,
            target = %event.target_id,
            metric = %event.metric,
            value = event.value,
            pid = event.pid,
            children = event.child_count,
            "resource metric"
        );
        gauge!(
            "observer_family_value",
            event.value,
            "observer" => event.observer.clone(),
            "metric" => event.metric.as_str(),
            "app" => event.app_name.clone()
        );
        Ok(())
    }

    fn report_health(&self, event: &HealthEvent) -> Result<()> {
        info!(
            source = %event.source_id,
            property = %event.property,
            state = %event.state,
            value = event.value,
            "health event"
        );
        Ok(())
    }

    fn emit_event(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        info!(event = name, payload = %payload, "operational event");
        Ok(())
    }
}

/// Append-only JSON-lines sink on local disk.
pub struct FileTelemetrySink {
    file: Mutex<File>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum FileRecord<'a> {
    Metric(&'a MetricEvent),
    Health(&'a HealthEvent),
    Event {
        name: &'a str,
        payload: &'a serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl FileTelemetrySink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ObserverAgentError::Telemetry(format!("create {}: {e}", parent.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                ObserverAgentError::Telemetry(format!("open {}: {e}", path.display()))
            })?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write(&self, record: &FileRecord<'_>) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| ObserverAgentError::Telemetry(e.to_string()))?;
        let mut file = self.file.lock();
        writeln!(file, "{line}").map_err(|e| ObserverAgentError::Telemetry(e.to_string()))
    }
}

impl TelemetrySink for FileTelemetrySink {
    fn report_metric(&self, event: &MetricEvent) -> Result<()> {
        self.write(&FileRecord::Metric(event))
    }

    fn report_health(&self, event: &HealthEvent) -> Result<()> {
        self.write(&FileRecord::Health(event))
    }

    fn emit_event(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        self.write(&FileRecord::Event {
            name,
            payload: &payload,
            timestamp: Utc::now(),
        })
    }
}

/// Fan-out sink. A failing child is logged and skipped.
pub struct CompositeTelemetrySink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl CompositeTelemetrySink {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for CompositeTelemetrySink {
    fn report_metric(&self, event: &MetricEvent) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.report_metric(event) {
                warn!(error = %e, "telemetry sink dropped a metric event");
            }
        }
        Ok(())
    }

    fn report_health(&self, event: &HealthEvent) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.report_health(event) {
                warn!(error = %e, "telemetry sink dropped a health event");
            }
        }
        Ok(())
    }

    fn emit_event(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.emit_event(name, payload.clone()) {
                warn!(error = %e, "telemetry sink dropped an operational event");
            }
        }
        Ok(())
    }
}

/// Telemetry bootstrap options.
#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    /// Directory for the daily-rolling agent log; `None` keeps console
    /// output only.
    pub log_dir: Option<String>,
    /// Emit JSON instead of human-readable console lines.
    pub json_format: bool,
    /// Install the Prometheus recorder for the agent's internal metrics.
    pub prometheus_recorder: bool,
}

impl TelemetryOptions {
    pub fn from_settings(settings: &crate::config::AgentSettings) -> Self {
        Self {
            log_dir: settings.log_dir.clone(),
            json_format: settings.log_json,
            prometheus_recorder: settings.prometheus_recorder,
        }
    }
}

/// Initialize the global tracing subscriber and the metrics recorder.
///
/// Thread-safe and idempotent: only the first call in a process installs
/// anything, later calls return `Ok` untouched. Test harnesses that
/// install their own subscriber win the race harmlessly.
pub fn init_telemetry(options: &TelemetryOptions) -> Result<()> {
    if TRACING_INITIALIZED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers = Vec::new();

    let console = tracing_subscriber::fmt::layer().with_target(true);
    if options.json_format {
        layers.push(console.json().boxed());
    } else {
        layers.push(console.boxed());
    }

    if let Some(dir) = &options.log_dir {
        let appender = tracing_appender::rolling::daily(dir, "observer.log");
        // The non-blocking guard must outlive the process; the agent runs
        // until exit, so leaking it is the intended lifecycle.
        let (writer, guard) = tracing_appender::non_blocking(appender);
        std::mem::forget(guard);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        );
    }

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .is_err()
    {
        TRACING_INITIALIZED.store(false, Ordering::Relaxed);
        return Ok(());
    }

    #[cfg(feature = "prometheus-recorder")]
    if options.prometheus_recorder {
        use metrics_exporter_prometheus::PrometheusBuilder;
        if let Err(e) = PrometheusBuilder::new().install() {
            warn!(error = %e, "prometheus recorder install failed; internal metrics disabled");
        }
    }

    info!(version = crate::AGENT_VERSION, "telemetry initialized");
    Ok(())
}
