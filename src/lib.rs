//! # Cluster Node Observer v1.4
//!
//! A production-ready per-node resource observability agent for clustered
//! application-hosting platforms. One long-running agent per cluster node
//! periodically samples resource usage for the service processes (and their
//! descendant processes) hosted on that node, compares each sample against
//! per-target thresholds, raises or clears health signals against the
//! cluster health store, and emits structured telemetry for downstream
//! ingestion.
//!
//! ## System Overview
//!
//! The agent is built around a small set of composable subsystems:
//!
//! - **Observation engine**: a cooperative scheduler ([`ObserverRunner`])
//!   that drives a set of pluggable observers on a bounded periodic loop
//!   with per-observer timeouts, quarantine, graceful shutdown, and
//!   in-place configuration reload.
//! - **Process-family resource sampler**: parallel per-process sampling
//!   of CPU, working set, private bytes, handles, threads, and TCP port
//!   usage across a host process and its transitive descendants, with
//!   pid-reuse protection on every sample attribution.
//! - **Threshold evaluation and health reporting**: circular-buffer
//!   statistics folded into family aggregates, warn/error threshold
//!   transitions, and an idempotent health-report lifecycle where an `Ok`
//!   report retires any prior non-Ok report under the same key.
//!
//! ## Architecture
//!
//! Data flows strictly one way through the pipeline:
//!
//! ```text
//! ObserverRunner
//!   └─ Observer::observe
//!        └─ TargetResolver ──► ResourceSampler ──► Evaluator ──► HealthReporter
//!                                (OsProbe +                        (HealthStore +
//!                                 ProcessTreeDiscovery)             TelemetrySink)
//! ```
//!
//! The OS, the cluster runtime, the health store, and the telemetry
//! backends are all narrow trait boundaries ([`OsProbe`], [`ClusterQuery`],
//! [`HealthStore`], [`TelemetrySink`]). The engine itself is
//! platform-agnostic; production implementations for the probe and the
//! process tree are provided on top of `sysinfo` and, on Linux, `procfs`.
//!
//! ## Operational Characteristics
//!
//! - Observers execute sequentially within the runner loop; sampling
//!   across targets inside one observer runs with bounded parallelism
//!   (a quarter of the node's cores by default).
//! - All sampling honors cooperative cancellation: between observers,
//!   between targets, and between samples inside a window.
//! - On shutdown the runner emits one compensating `Ok` report for every
//!   outstanding non-Ok health event it has authored, so no stale signal
//!   survives the process.
//! - Faults are absorbed at the narrowest possible scope: per-sample,
//!   per-target, per-metric, per-pass, per-observer. Only privilege loss
//!   and out-of-memory escalate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cluster_node_observer::{
//!     AgentSettings, AppObserver, ObserverRunner, SystemObserver,
//! };
//! use cluster_node_observer::os_probe::SystemProbe;
//! use cluster_node_observer::process_tree::SnapshotProcessTree;
//!
//! # async fn run(cluster: Arc<dyn cluster_node_observer::ClusterQuery>,
//! #              store: Arc<dyn cluster_node_observer::HealthStore>,
//! #              sink: Arc<dyn cluster_node_observer::TelemetrySink>)
//! #              -> cluster_node_observer::Result<()> {
//! let settings = AgentSettings::load()?;
//! let probe = Arc::new(SystemProbe::from_settings(&settings));
//! let tree = Arc::new(SnapshotProcessTree::new());
//!
//! let app = AppObserver::new(&settings, cluster.clone(), probe.clone(),
//!                            tree.clone(), store.clone(), sink.clone());
//! let system = SystemObserver::new(&settings, probe, tree, store.clone(), sink.clone());
//!
//! let mut runner = ObserverRunner::new(
//!     settings,
//!     vec![Box::new(app), Box::new(system)],
//!     store,
//!     sink,
//! );
//! runner.run().await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Agent version string, reported in operational telemetry and compared
/// against the upstream version manifest by the daily version check.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// Engine modules - scheduling, sampling, evaluation, reporting
pub mod app_observer;      // User-target observer: JSON target list through the full pipeline
pub mod evaluator;         // Threshold evaluation, state transitions, dump requests
pub mod observer;          // Observer contract and per-observer runtime bookkeeping
pub mod observer_runner;   // Sequential scheduler, timeouts, reload, shutdown sweep
pub mod resource_sampler;  // Bounded-parallel process-family sampling windows
pub mod sample_buffer;     // Fixed-capacity numeric buffers and concurrent metric maps
pub mod system_observer;   // System-services observer with aggregate snapshot
pub mod target_resolver;   // Target list expansion, filtering, and normalization

// Boundary modules - OS, cluster runtime, health store, telemetry
pub mod cluster_query;     // Cluster runtime queries and resource-governance extraction
pub mod config;            // Layered settings, per-observer config, JSON target specs
pub mod dump;              // Process dump requests with a process-wide rate bucket
pub mod health;            // Health events, report keying, retire-on-Ok discipline
pub mod os_probe;          // Point-sample probes over the host OS
pub mod process_tree;      // Descendant discovery and pid re-verification
pub mod telemetry;         // Telemetry sink contract and tracing/metrics emission

// Re-export the types an embedding program needs to assemble the agent.
pub use app_observer::AppObserver;
pub use cluster_query::ClusterQuery;
pub use config::{AgentSettings, ObserverSettings, TargetSpec};
pub use health::{HealthEvent, HealthState, HealthStore};
pub use observer::Observer;
pub use observer_runner::{ObserverRunner, RunnerExit};
pub use os_probe::OsProbe;
pub use process_tree::ProcessTreeDiscovery;
pub use system_observer::SystemObserver;
pub use telemetry::TelemetrySink;

/// Comprehensive error type covering all agent subsystems and failure modes
///
/// Variants mirror the agent's fault-handling policy: transient errors are
/// absorbed close to where they occur, configuration errors surface as
/// node-level warnings, and only privilege loss and memory exhaustion are
/// allowed to escalate past the runner.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ObserverAgentError {
    /// Transient platform error - process vanished, query timeout, counter
    /// access denied. Swallowed inside the sampler; the sample is discarded.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Configuration error - missing or malformed settings, unusable target
    /// specs. Surfaced as a node-level Warning health event.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Cluster runtime query failure - deployed-app enumeration, replica
    /// listing, manifest retrieval.
    #[error("Cluster query error: {0}")]
    ClusterQuery(String),

    /// Application manifest could not be parsed or the requested policy
    /// subtree was malformed.
    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    /// An observer exceeded its hard per-run timeout. The runner quarantines
    /// the observer for the remainder of the process lifetime.
    #[error("Observer '{observer}' timed out after {timeout_secs}s")]
    ObserverTimeout { observer: String, timeout_secs: u64 },

    /// Health store emission failure. Logged; never aborts a pass.
    #[error("Health store error: {0}")]
    HealthStore(String),

    /// Telemetry sink failure. Logged; never aborts a pass.
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// The process lost an OS capability it needs (typically cleared by a
    /// platform upgrade). Escalates: the process terminates so the
    /// supervisor restarts it with capabilities re-applied.
    #[error("Privilege loss: {0}")]
    PrivilegeLoss(String),

    /// Memory exhaustion. Fatal: the runner emits a critical telemetry
    /// event and fails fast.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The operation was cancelled through the cooperative token.
    #[error("Operation cancelled")]
    Cancelled,

    /// General system errors - unexpected conditions, internal failures.
    #[error("System error: {0}")]
    System(String),
}

impl ObserverAgentError {
    /// True when the runner must terminate the process on this error
    /// rather than recover locally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObserverAgentError::PrivilegeLoss(_) | ObserverAgentError::OutOfMemory(_)
        )
    }
}

/// Result type for all observer agent operations
///
/// Provides a consistent error handling interface across the crate; all
/// public API functions return this alias.
pub type Result<T> = std::result::Result<T, ObserverAgentError>;
