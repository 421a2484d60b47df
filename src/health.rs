//! # Health Reporting - Events, Keying, and the Retire Discipline
//!
//! The unit of user-visible signal is the [`HealthEvent`], keyed by
//! `(entity, source_id, property)`. The key discipline is what makes
//! reporting idempotent:
//!
//! - a non-Ok event raises or refreshes the signal under its key,
//! - an Ok event under the same key retires whatever was outstanding,
//! - on shutdown the reporter sweeps one Ok event per outstanding key so
//!   no stale signal survives the process.
//!
//! `source_id` is `"{observer}({code})"` where the code identifies the
//! metric domain and never varies with severity - a Warning and the Ok
//! that clears it must share a key. `property` is a stable string tied to
//! the metric and target (`"CpuTime:App1:Svc1"`).
//!
//! Events flow to the cluster health store and the telemetry sink;
//! a failure in either path is logged and never aborts an observer pass.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::MetricKind;
use crate::telemetry::TelemetrySink;
use crate::Result;

/// Maximum jitter added to report TTLs so simultaneous expiry doesn't
/// stampede the health store.
const TTL_JITTER_MAX: Duration = Duration::from_secs(30);

/// Health state ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthState {
    Ok,
    Warning,
    Error,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Ok => write!(f, "OK"),
            HealthState::Warning => write!(f, "WARNING"),
            HealthState::Error => write!(f, "ERROR"),
        }
    }
}

/// The cluster entity a report is filed against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// This node.
    Node,
    /// An application, by URI.
    Application(String),
    /// A service, by URI.
    Service(String),
}

/// Identity of a health signal. Two events with equal keys address the
/// same signal; the later one wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HealthKey {
    pub entity: EntityKind,
    pub source_id: String,
    pub property: String,
}

/// One health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub node_name: String,
    pub entity: EntityKind,
    pub source_id: String,
    pub property: String,
    pub state: HealthState,
    pub message: String,
    pub ttl: Duration,
    pub timestamp: DateTime<Utc>,
    pub metric: Option<MetricKind>,
    pub value: Option<f64>,
}

impl HealthEvent {
    pub fn key(&self) -> HealthKey {
        HealthKey {
            entity: self.entity.clone(),
            source_id: self.source_id.clone(),
            property: self.property.clone(),
        }
    }
}

/// The cluster health store boundary.
///
/// Implementations should queue or complete quickly; the reporter calls
/// from inside observer passes and logs (rather than propagates) failures.
pub trait HealthStore: Send + Sync {
    fn emit(&self, event: HealthEvent) -> Result<()>;
}

/// Stable source code per metric domain. Severity never appears here:
/// the Ok that clears a Warning must carry the same source id.
pub fn source_code(metric: MetricKind) -> &'static str {
    match metric {
        MetricKind::CpuTime => "CPU",
        MetricKind::WorkingSetMb | MetricKind::WorkingSetPct => "Memory",
        MetricKind::PrivateBytesMb | MetricKind::PrivateBytesPct => "PrivateBytes",
        MetricKind::ActiveTcpPorts => "ActivePorts",
        MetricKind::EphemeralPorts | MetricKind::EphemeralPortsPct => "EphemeralPorts",
        MetricKind::FileHandles => "FileHandles",
        MetricKind::Threads => "Threads",
        MetricKind::RgMemoryPct => "RGMemory",
    }
}

/// `"{observer}({code})"`.
pub fn source_id(observer_name: &str, code: &str) -> String {
    format!("{observer_name}({code})")
}

/// `"{metric}:{app_leaf}:{service_leaf}"` - the stable property for a
/// (metric, target) pair.
pub fn property_for(metric: MetricKind, app_name: &str, service_name: &str) -> String {
    format!(
        "{}:{}:{}",
        metric.as_str(),
        uri_leaf(app_name),
        uri_leaf(service_name)
    )
}

/// Last segment of an application/service URI.
pub fn uri_leaf(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

/// Emits health reports with the key discipline and tracks outstanding
/// non-Ok signals for the shutdown sweep.
pub struct HealthReporter {
    node_name: String,
    store: Arc<dyn HealthStore>,
    sink: Arc<dyn TelemetrySink>,
    outstanding: DashMap<HealthKey, HealthState>,
}

impl HealthReporter {
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<dyn HealthStore>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            sink,
            outstanding: DashMap::new(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Report TTL: twice the observer interval plus jitter, so a signal
    /// outlives one missed pass but not a dead observer.
    pub fn ttl_for(run_interval: Duration) -> Duration {
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=TTL_JITTER_MAX);
        run_interval * 2 + jitter
    }

    /// The state currently outstanding for `key` (`Ok` when none is).
    pub fn current_state(&self, key: &HealthKey) -> HealthState {
        self.outstanding
            .get(key)
            .map(|s| *s.value())
            .unwrap_or(HealthState::Ok)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Emit one event to the health store and the telemetry sink, and
    /// update the outstanding-key registry. Failures in either path are
    /// logged; the pass continues.
    pub fn report(&self, event: HealthEvent) {
        let key = event.key();
        match event.state {
            HealthState::Ok => {
                self.outstanding.remove(&key);
            }
            state => {
                self.outstanding.insert(key, state);
            }
        }

        debug!(
            source = %event.source_id,
            property = %event.property,
            state = %event.state,
            value = event.value,
            "health report"
        );

        if let Err(e) = self.store.emit(event.clone()) {
            warn!(error = %e, property = %event.property, "health store emission failed");
        }
        if let Err(e) = self.sink.report_health(&event) {
            warn!(error = %e, property = %event.property, "telemetry health emission failed");
        }
    }

    /// Convenience constructor for threshold-driven events.
    #[allow(clippy::too_many_arguments)]
    pub fn metric_event(
        &self,
        entity: EntityKind,
        observer_name: &str,
        metric: MetricKind,
        app_name: &str,
        service_name: &str,
        state: HealthState,
        value: f64,
        message: String,
        ttl: Duration,
    ) -> HealthEvent {
        HealthEvent {
            node_name: self.node_name.clone(),
            entity,
            source_id: source_id(observer_name, source_code(metric)),
            property: property_for(metric, app_name, service_name),
            state,
            message,
            ttl,
            timestamp: Utc::now(),
            metric: Some(metric),
            value: Some(value),
        }
    }

    /// Node-scoped warning for non-metric conditions (configuration
    /// problems, observer failures).
    pub fn node_report(
        &self,
        observer_name: &str,
        code: &str,
        property: impl Into<String>,
        state: HealthState,
        message: impl Into<String>,
        ttl: Duration,
    ) {
        self.report(HealthEvent {
            node_name: self.node_name.clone(),
            entity: EntityKind::Node,
            source_id: source_id(observer_name, code),
            property: property.into(),
            state,
            message: message.into(),
            ttl,
            timestamp: Utc::now(),
            metric: None,
            value: None,
        });
    }

    /// Emit one compensating Ok per outstanding non-Ok key. Called on
    /// shutdown; returns the number of events emitted.
    pub fn sweep_ok(&self, reason: &str) -> usize {
        let keys: Vec<HealthKey> = self
            .outstanding
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            self.report(HealthEvent {
                node_name: self.node_name.clone(),
                entity: key.entity.clone(),
                source_id: key.source_id.clone(),
                property: key.property.clone(),
                state: HealthState::Ok,
                message: reason.to_string(),
                ttl: Duration::from_secs(60),
                timestamp: Utc::now(),
                metric: None,
                value: None,
            });
        }
        keys.len()
    }
}
