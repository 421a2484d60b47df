//! Shared test doubles for the integration suite: a scripted OS probe, a
//! scripted process tree, an in-memory cluster, and recording health /
//! telemetry backends.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use cluster_node_observer::cluster_query::{
    AppRef, ClusterQuery, CodePackage, HostKind, Replica, ReplicaRole, ServiceKind,
    UpgradeProgress, UpgradeState,
};
use cluster_node_observer::config::{AgentSettings, ObserverSettings, TargetSpec};
use cluster_node_observer::health::{HealthEvent, HealthState, HealthStore};
use cluster_node_observer::os_probe::{MemoryInfo, OsProbe};
use cluster_node_observer::process_tree::{ChildProc, ProcessTreeDiscovery};
use cluster_node_observer::telemetry::{MetricEvent, TelemetrySink};
use cluster_node_observer::{ObserverAgentError, Result};

pub const NODE: &str = "node-0";

// ── OS probe ───────────────────────────────────────────────────────────

/// Probe returning scripted per-pid values and recording which pids were
/// queried.
#[derive(Default)]
pub struct MockProbe {
    pub cpu: Mutex<HashMap<u32, f64>>,
    pub working_set: Mutex<HashMap<u32, f64>>,
    pub private_bytes: Mutex<HashMap<u32, f64>>,
    pub handles: Mutex<HashMap<u32, i64>>,
    pub threads: Mutex<HashMap<u32, i64>>,
    pub tcp_ports: Mutex<HashMap<u32, i64>>,
    pub queried_pids: Mutex<HashSet<u32>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cpu(&self, pid: u32, pct: f64) {
        self.cpu.lock().insert(pid, pct);
    }

    pub fn set_working_set(&self, pid: u32, mb: f64) {
        self.working_set.lock().insert(pid, mb);
    }

    pub fn was_queried(&self, pid: u32) -> bool {
        self.queried_pids.lock().contains(&pid)
    }

    fn mark(&self, pid: u32) {
        self.queried_pids.lock().insert(pid);
    }
}

impl OsProbe for MockProbe {
    fn cpu_percent(&self, pid: u32) -> f64 {
        self.mark(pid);
        self.cpu.lock().get(&pid).copied().unwrap_or(-1.0)
    }
    fn working_set_mb(&self, pid: u32, _name: Option<&str>, _private: bool) -> f64 {
        self.mark(pid);
        self.working_set.lock().get(&pid).copied().unwrap_or(0.0)
    }
    fn private_bytes_mb(&self, pid: u32) -> f64 {
        self.mark(pid);
        self.private_bytes.lock().get(&pid).copied().unwrap_or(0.0)
    }
    fn handle_count(&self, pid: u32) -> i64 {
        self.mark(pid);
        self.handles.lock().get(&pid).copied().unwrap_or(-1)
    }
    fn thread_count(&self, pid: u32) -> i64 {
        self.mark(pid);
        self.threads.lock().get(&pid).copied().unwrap_or(0)
    }
    fn active_tcp_port_count(&self, pid: u32) -> i64 {
        self.mark(pid);
        self.tcp_ports.lock().get(&pid).copied().unwrap_or(0)
    }
    fn active_ephemeral_port_count(&self, pid: u32) -> i64 {
        self.mark(pid);
        0
    }
    fn ephemeral_port_pct(&self, _pid: u32) -> f64 {
        0.0
    }
    fn ephemeral_port_range(&self) -> Option<(u16, u16)> {
        Some((32768, 60999))
    }
    fn commit_limit_gb(&self) -> f64 {
        16.0
    }
    fn physical_memory_info(&self) -> MemoryInfo {
        MemoryInfo {
            total_gb: 8.0,
            used_gb: 4.0,
            used_pct: 50.0,
        }
    }
    fn os_identity(&self) -> String {
        "mock-os 1.0".to_string()
    }
}

// ── Process tree ───────────────────────────────────────────────────────

#[derive(Clone)]
struct TreeEntry {
    proc: ChildProc,
    parent: Option<u32>,
}

/// Scripted process table with parent links.
#[derive(Default)]
pub struct MockTree {
    entries: Mutex<HashMap<u32, TreeEntry>>,
}

impl MockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pid: u32, name: &str, start_time: u64, parent: Option<u32>) {
        self.entries.lock().insert(
            pid,
            TreeEntry {
                proc: ChildProc {
                    pid,
                    name: name.to_string(),
                    start_time,
                },
                parent,
            },
        );
    }

    pub fn kill(&self, pid: u32) {
        self.entries.lock().remove(&pid);
    }
}

impl ProcessTreeDiscovery for MockTree {
    fn snapshot(&self) {}

    fn children(&self, root_pid: u32) -> Vec<ChildProc> {
        let entries = self.entries.lock();
        let mut result = Vec::new();
        let mut frontier = VecDeque::from([root_pid]);
        while let Some(pid) = frontier.pop_front() {
            for entry in entries.values() {
                if entry.parent == Some(pid) {
                    result.push(entry.proc.clone());
                    frontier.push_back(entry.proc.pid);
                }
            }
        }
        result
    }

    fn find_processes_by_name(&self, name: &str) -> Vec<ChildProc> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.proc.name == name)
            .map(|e| e.proc.clone())
            .collect()
    }

    fn process_info(&self, pid: u32) -> Option<ChildProc> {
        self.entries.lock().get(&pid).map(|e| e.proc.clone())
    }

    fn ensure_process(&self, pid: u32, name: &str, start_time: u64) -> bool {
        self.entries
            .lock()
            .get(&pid)
            .map(|e| e.proc.name == name && e.proc.start_time == start_time)
            .unwrap_or(false)
    }
}

// ── Cluster ────────────────────────────────────────────────────────────

/// In-memory cluster state, recording which applications were queried.
#[derive(Default)]
pub struct MockCluster {
    pub apps: Mutex<Vec<AppRef>>,
    pub replicas: Mutex<HashMap<String, Vec<Replica>>>,
    pub packages: Mutex<HashMap<String, Vec<CodePackage>>>,
    pub manifests: Mutex<HashMap<String, String>>,
    pub replica_queries: Mutex<Vec<String>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_app(&self, app_name: &str, app_type: &str) {
        self.apps.lock().push(AppRef {
            app_name: app_name.to_string(),
            app_type_name: app_type.to_string(),
            app_type_version: "1.0.0".to_string(),
            parameters: HashMap::new(),
        });
    }

    pub fn add_stateless_replica(&self, app_name: &str, service_leaf: &str, host_pid: u32) {
        self.add_replica(app_name, service_leaf, host_pid, ServiceKind::Stateless, None)
    }

    pub fn add_replica(
        &self,
        app_name: &str,
        service_leaf: &str,
        host_pid: u32,
        kind: ServiceKind,
        role: Option<ReplicaRole>,
    ) {
        let mut replicas = self.replicas.lock();
        let list = replicas.entry(app_name.to_string()).or_default();
        list.push(Replica {
            app_name: app_name.to_string(),
            service_name: format!("{app_name}/{service_leaf}"),
            service_type_name: format!("{service_leaf}Type"),
            service_kind: kind,
            role,
            replica_or_instance_id: host_pid as i64,
            partition_id: uuid::Uuid::new_v4(),
            host_pid,
            service_manifest_name: format!("{service_leaf}Pkg"),
            code_package_name: "Code".to_string(),
        });
    }

    pub fn set_manifest(&self, app_type: &str, xml: &str) {
        self.manifests.lock().insert(app_type.to_string(), xml.to_string());
    }

    pub fn add_code_package(
        &self,
        app_name: &str,
        manifest: &str,
        package_name: &str,
        host_kind: HostKind,
        pid: Option<u32>,
    ) {
        self.packages
            .lock()
            .entry(app_name.to_string())
            .or_default()
            .push(CodePackage {
                name: package_name.to_string(),
                service_manifest_name: manifest.to_string(),
                host_kind,
                pid,
            });
    }

    pub fn replica_query_count(&self, app_name: &str) -> usize {
        self.replica_queries
            .lock()
            .iter()
            .filter(|a| a.as_str() == app_name)
            .count()
    }
}

#[async_trait]
impl ClusterQuery for MockCluster {
    async fn list_deployed_apps(&self, _node: &str) -> Result<Vec<AppRef>> {
        Ok(self.apps.lock().clone())
    }

    async fn list_deployed_replicas(&self, _node: &str, app_uri: &str) -> Result<Vec<Replica>> {
        self.replica_queries.lock().push(app_uri.to_string());
        Ok(self.replicas.lock().get(app_uri).cloned().unwrap_or_default())
    }

    async fn list_deployed_code_packages(
        &self,
        _node: &str,
        app_uri: &str,
        service_manifest: &str,
    ) -> Result<Vec<CodePackage>> {
        let packages = self.packages.lock().get(app_uri).cloned().unwrap_or_default();
        if service_manifest.is_empty() {
            return Ok(packages);
        }
        Ok(packages
            .into_iter()
            .filter(|p| p.service_manifest_name == service_manifest)
            .collect())
    }

    async fn application_manifest(&self, app_type: &str, _version: &str) -> Result<String> {
        self.manifests
            .lock()
            .get(app_type)
            .cloned()
            .ok_or_else(|| ObserverAgentError::ClusterQuery(format!("no manifest for {app_type}")))
    }

    async fn application_upgrade_progress(&self, _app_uri: &str) -> Result<UpgradeProgress> {
        Ok(UpgradeProgress {
            state: UpgradeState::NotUpgrading,
            target_version: None,
            current_domain: None,
        })
    }

    async fn cluster_upgrade_progress(&self) -> Result<UpgradeProgress> {
        Ok(UpgradeProgress {
            state: UpgradeState::NotUpgrading,
            target_version: None,
            current_domain: None,
        })
    }
}

// ── Recording backends ─────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingStore {
    pub events: Mutex<Vec<HealthEvent>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<HealthEvent> {
        self.events.lock().clone()
    }

    pub fn with_state(&self, state: HealthState) -> Vec<HealthEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.state == state)
            .cloned()
            .collect()
    }

    /// Threshold-driven events only (metric attached), excluding
    /// informational snapshots and config reports.
    pub fn metric_events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.metric.is_some())
            .cloned()
            .collect()
    }
}

impl HealthStore for RecordingStore {
    fn emit(&self, event: HealthEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub metrics: Mutex<Vec<MetricEvent>>,
    pub health: Mutex<Vec<HealthEvent>>,
    pub named: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TelemetrySink for RecordingSink {
    fn report_metric(&self, event: &MetricEvent) -> Result<()> {
        self.metrics.lock().push(event.clone());
        Ok(())
    }
    fn report_health(&self, event: &HealthEvent) -> Result<()> {
        self.health.lock().push(event.clone());
        Ok(())
    }
    fn emit_event(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        self.named.lock().push((name.to_string(), payload));
        Ok(())
    }
}

// ── Settings helpers ───────────────────────────────────────────────────

/// Agent settings with a single-sample window and inline target specs,
/// sized for fast tests.
pub fn agent_settings(specs: Vec<TargetSpec>) -> AgentSettings {
    AgentSettings {
        node_name: NODE.to_string(),
        loop_sleep_secs: 0,
        operational_telemetry: false,
        app_observer: ObserverSettings {
            run_interval_secs: 0,
            monitor_duration_secs: 0,
            sample_interval_ms: 1,
            target_specs: specs,
            ..ObserverSettings::default()
        },
        system_observer: ObserverSettings {
            run_interval_secs: 0,
            monitor_duration_secs: 0,
            sample_interval_ms: 1,
            ..ObserverSettings::default()
        },
        ..AgentSettings::default()
    }
}

/// A spec monitoring CPU with the canonical 60/80 limits.
pub fn cpu_spec(target_app: &str) -> TargetSpec {
    TargetSpec {
        target_app: Some(target_app.to_string()),
        cpu_warning_limit_percent: 60.0,
        cpu_error_limit_percent: 80.0,
        ..TargetSpec::default()
    }
}

/// Full rig: probe + tree + cluster + recording backends.
pub struct Rig {
    pub probe: Arc<MockProbe>,
    pub tree: Arc<MockTree>,
    pub cluster: Arc<MockCluster>,
    pub store: Arc<RecordingStore>,
    pub sink: Arc<RecordingSink>,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(MockProbe::new()),
            tree: Arc::new(MockTree::new()),
            cluster: Arc::new(MockCluster::new()),
            store: Arc::new(RecordingStore::new()),
            sink: Arc::new(RecordingSink::new()),
        }
    }

    /// One deployed app with one stateless service hosted by `pid`.
    pub fn seed_simple_app(&self, app: &str, service_leaf: &str, pid: u32) {
        let app_type = format!("{}Type", app.rsplit('/').next().unwrap_or("App"));
        self.cluster.add_app(app, &app_type);
        self.cluster.add_stateless_replica(app, service_leaf, pid);
        self.tree.add(pid, "svc_host", 10, None);
    }
}
