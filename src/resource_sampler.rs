//! # Resource Sampler - Bounded-Parallel Family Sampling
//!
//! For each resolved [`ServiceTarget`], samples every metric with a
//! configured threshold for the host process and its live descendants,
//! writing into per-metric [`MetricMap`]s keyed by target/child identity.
//!
//! ## Sampling Model
//!
//! - Point metrics (ports, handles, threads, private bytes, RG percent)
//!   are read once per pass per process.
//! - Windowed metrics (CPU, working set) are read in a loop for the
//!   configured monitor duration with a fixed inter-sample delay. CPU gets
//!   one untimed warm-up call before the window so the first measured
//!   delta is meaningful; CPU readings are clamped to `0..=100` and the
//!   vanished-process marker (`-1`) is skipped, never recorded as zero.
//! - Every sample attribution is preceded by a pid re-verification
//!   through [`ProcessTreeDiscovery::ensure_process`]; a failed check
//!   records nothing.
//!
//! ## Concurrency and Cancellation
//!
//! Targets are sampled with bounded parallelism: a quarter of the node's
//! cores by default, forced to one on small nodes, overridable from
//! settings. Cancellation is checked between targets and between window
//! iterations; on cancel the sampler stops appending and returns cleanly.
//!
//! A child that exits mid-window has its partial data discarded. If the
//! host process itself exits, the whole family's buffers are dropped and
//! the target contributes nothing this pass.

use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{MetricKind, ObserverSettings};
use crate::os_probe::OsProbe;
use crate::process_tree::{ChildProc, ProcessTreeDiscovery};
use crate::sample_buffer::{append_sample, reset_buffer, MetricMap};
use crate::target_resolver::ServiceTarget;

/// Fraction of cores used for target-parallel sampling.
const PARALLELISM_FRACTION: f64 = 0.25;

/// The per-metric buffer maps for one observer. Owned by the observer and
/// reused across passes so buffers flagged by the evaluator survive for
/// hysteresis.
pub struct MetricMaps {
    maps: HashMap<MetricKind, MetricMap>,
}

impl MetricMaps {
    pub fn new() -> Self {
        Self {
            maps: MetricKind::all()
                .into_iter()
                .map(|k| (k, MetricMap::new()))
                .collect(),
        }
    }

    pub fn map(&self, kind: MetricKind) -> &MetricMap {
        // Every kind is pre-created in `new`.
        &self.maps[&kind]
    }

    /// Remove every buffer whose id belongs to the family of `target_id`,
    /// optionally keeping the parent entry itself.
    pub fn remove_family(&self, target_id: &str, keep_parent: bool) {
        for map in self.maps.values() {
            map.retain(|id, _| {
                if !id.starts_with(target_id) {
                    return true;
                }
                keep_parent && id.as_str() == target_id
            });
        }
    }

    /// Total buffer count across all metric maps (diagnostics).
    pub fn buffer_count(&self) -> usize {
        self.maps.values().map(|m| m.len()).sum()
    }
}

impl Default for MetricMaps {
    fn default() -> Self {
        Self::new()
    }
}

/// Effective sampling parallelism: `max(1, ceil(cores × 0.25))`, forced to
/// one when fewer than four cores are available. A configured override
/// still respects the small-node clamp.
pub fn effective_parallelism(requested: Option<usize>) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if cores < 4 {
        return 1;
    }
    match requested {
        Some(n) => n.max(1),
        None => ((cores as f64 * PARALLELISM_FRACTION).ceil() as usize).max(1),
    }
}

/// Denominators shared by the percent metrics, read once per pass.
#[derive(Debug, Clone, Copy, Default)]
struct PassDenominators {
    total_physical_mb: f64,
    commit_limit_mb: f64,
}

/// Samples resolved targets into metric maps.
pub struct ResourceSampler {
    probe: Arc<dyn OsProbe>,
    tree: Arc<dyn ProcessTreeDiscovery>,
    settings: ObserverSettings,
}

impl ResourceSampler {
    pub fn new(
        probe: Arc<dyn OsProbe>,
        tree: Arc<dyn ProcessTreeDiscovery>,
        settings: ObserverSettings,
    ) -> Self {
        Self {
            probe,
            tree,
            settings,
        }
    }

    pub fn update_settings(&mut self, settings: ObserverSettings) {
        self.settings = settings;
    }

    /// Sample all targets with bounded parallelism. Returns the number of
    /// targets actually sampled (parents that passed verification).
    pub async fn sample_targets(
        &self,
        targets: &[ServiceTarget],
        maps: &MetricMaps,
        ctx: &CancellationToken,
    ) -> usize {
        let parallel = effective_parallelism(self.settings.max_parallel);
        let denominators = PassDenominators {
            total_physical_mb: self.probe.physical_memory_info().total_gb * 1024.0,
            commit_limit_mb: self.probe.commit_limit_gb() * 1024.0,
        };

        let sampled = std::sync::atomic::AtomicUsize::new(0);
        futures::stream::iter(targets)
            .for_each_concurrent(parallel, |target| {
                let sampled = &sampled;
                async move {
                    if ctx.is_cancelled() {
                        return;
                    }
                    if self.sample_target(target, maps, denominators, ctx).await {
                        sampled.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            })
            .await;
        sampled.into_inner()
    }

    /// Sample one target's family. Returns false when the parent was
    /// stale and the target was skipped.
    async fn sample_target(
        &self,
        target: &ServiceTarget,
        maps: &MetricMaps,
        denominators: PassDenominators,
        ctx: &CancellationToken,
    ) -> bool {
        let parent_ok = self.tree.ensure_process(
            target.host_pid,
            &target.host_process_name,
            target.host_process_start_time,
        );
        if !parent_ok {
            debug!(
                target = %target.target_id(),
                pid = target.host_pid,
                "host process is stale or gone; target skipped this pass"
            );
            return false;
        }

        let target_id = target.target_id();

        // The family at window start: parent plus still-verified children.
        let live_children: Vec<&ChildProc> = target
            .children
            .iter()
            .filter(|c| self.tree.ensure_process(c.pid, &c.name, c.start_time))
            .collect();

        let enabled: Vec<MetricKind> = target.thresholds.enabled_metrics().collect();
        if enabled.is_empty() {
            return false;
        }

        // Fresh windows for every enabled metric and family member.
        for kind in &enabled {
            let map = maps.map(*kind);
            reset_buffer(map, &target_id, self.settings.buffer_capacity);
            for child in &live_children {
                reset_buffer(map, &target.child_id(child), self.settings.buffer_capacity);
            }
        }

        self.sample_point_metrics(target, &target_id, &live_children, &enabled, denominators, maps);

        let windowed: Vec<MetricKind> =
            enabled.iter().copied().filter(MetricKind::is_windowed).collect();
        if !windowed.is_empty() {
            let completed = self
                .sample_window(target, &target_id, &live_children, &windowed, denominators, maps, ctx)
                .await;
            if !completed {
                // The host process died mid-window; nothing from this
                // family is trustworthy.
                maps.remove_family(&target_id, false);
                return false;
            }
        }

        true
    }

    /// One-shot metrics: ports, handles, threads, private bytes, RG
    /// percent. Probe failure values are skipped, not recorded.
    fn sample_point_metrics(
        &self,
        target: &ServiceTarget,
        target_id: &str,
        children: &[&ChildProc],
        enabled: &[MetricKind],
        denominators: PassDenominators,
        maps: &MetricMaps,
    ) {
        let capacity = self.settings.buffer_capacity;
        let family: Vec<(String, u32, &str)> = std::iter::once((
            target_id.to_string(),
            target.host_pid,
            target.host_process_name.as_str(),
        ))
        .chain(
            children
                .iter()
                .map(|c| (target.child_id(c), c.pid, c.name.as_str())),
        )
        .collect();

        for kind in enabled {
            if kind.is_windowed() {
                continue;
            }
            let map = maps.map(*kind);
            for (id, pid, name) in &family {
                let value = match kind {
                    MetricKind::PrivateBytesMb => {
                        let mb = self.probe.private_bytes_mb(*pid);
                        (mb > 0.0).then_some(mb)
                    }
                    MetricKind::PrivateBytesPct => {
                        let mb = self.probe.private_bytes_mb(*pid);
                        (mb > 0.0 && denominators.commit_limit_mb > 0.0)
                            .then(|| mb * 100.0 / denominators.commit_limit_mb)
                    }
                    MetricKind::ActiveTcpPorts => {
                        let n = self.probe.active_tcp_port_count(*pid);
                        (n >= 0).then_some(n as f64)
                    }
                    MetricKind::EphemeralPorts => {
                        let n = self.probe.active_ephemeral_port_count(*pid);
                        (n >= 0).then_some(n as f64)
                    }
                    MetricKind::EphemeralPortsPct => Some(self.probe.ephemeral_port_pct(*pid)),
                    MetricKind::FileHandles => {
                        let n = self.probe.handle_count(*pid);
                        (n >= 0).then_some(n as f64)
                    }
                    MetricKind::Threads => {
                        let n = self.probe.thread_count(*pid);
                        (n > 0).then_some(n as f64)
                    }
                    MetricKind::RgMemoryPct => {
                        let limit = target.rg_memory_limit_mb.unwrap_or(0.0);
                        if !target.rg_enabled || limit <= 0.0 {
                            None
                        } else {
                            let mb = self.probe.working_set_mb(*pid, Some(name), false);
                            (mb > 0.0).then(|| mb * 100.0 / limit)
                        }
                    }
                    _ => None,
                };
                if let Some(v) = value {
                    if self.tree.ensure_process(
                        *pid,
                        name,
                        start_time_for(target, children, *pid),
                    ) {
                        append_sample(map, id, capacity, v);
                    }
                }
            }
        }
    }

    /// The CPU / working-set window loop. Returns false when the host
    /// process vanished mid-window.
    #[allow(clippy::too_many_arguments)]
    async fn sample_window(
        &self,
        target: &ServiceTarget,
        target_id: &str,
        children: &[&ChildProc],
        windowed: &[MetricKind],
        denominators: PassDenominators,
        maps: &MetricMaps,
        ctx: &CancellationToken,
    ) -> bool {
        let capacity = self.settings.buffer_capacity;
        let wants_cpu = windowed.contains(&MetricKind::CpuTime);

        // CPU warm-up: one untimed call per family member.
        if wants_cpu {
            let _ = self.probe.cpu_percent(target.host_pid);
            for child in children {
                let _ = self.probe.cpu_percent(child.pid);
            }
        }

        let mut dead_children: HashSet<u32> = HashSet::new();
        let deadline = Instant::now() + self.settings.monitor_duration();

        loop {
            // Parent first; a dead parent invalidates the whole window.
            if !self.tree.ensure_process(
                target.host_pid,
                &target.host_process_name,
                target.host_process_start_time,
            ) {
                return false;
            }
            self.sample_windowed_once(
                target.host_pid,
                &target.host_process_name,
                target_id,
                windowed,
                denominators,
                maps,
                capacity,
            );

            for child in children {
                if dead_children.contains(&child.pid) {
                    continue;
                }
                if !self.tree.ensure_process(child.pid, &child.name, child.start_time) {
                    dead_children.insert(child.pid);
                    continue;
                }
                self.sample_windowed_once(
                    child.pid,
                    &child.name,
                    &target.child_id(child),
                    windowed,
                    denominators,
                    maps,
                    capacity,
                );
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = ctx.cancelled() => return true,
                _ = tokio::time::sleep(self.settings.sample_interval()) => {}
            }
        }

        // A child that died mid-window contributes nothing: partial data
        // is discarded.
        for child in children {
            if dead_children.contains(&child.pid) {
                let child_id = target.child_id(child);
                for kind in windowed {
                    maps.map(*kind).remove(&child_id);
                }
                trace!(child = %child_id, "descendant exited mid-window; partial samples dropped");
            }
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn sample_windowed_once(
        &self,
        pid: u32,
        name: &str,
        id: &str,
        windowed: &[MetricKind],
        denominators: PassDenominators,
        maps: &MetricMaps,
        capacity: usize,
    ) {
        for kind in windowed {
            match kind {
                MetricKind::CpuTime => {
                    let cpu = self.probe.cpu_percent(pid);
                    if cpu >= 0.0 {
                        append_sample(maps.map(*kind), id, capacity, cpu.clamp(0.0, 100.0));
                    }
                }
                MetricKind::WorkingSetMb => {
                    let mb = self.probe.working_set_mb(pid, Some(name), false);
                    if mb > 0.0 {
                        append_sample(maps.map(*kind), id, capacity, mb);
                    }
                }
                MetricKind::WorkingSetPct => {
                    let mb = self.probe.working_set_mb(pid, Some(name), false);
                    if mb > 0.0 && denominators.total_physical_mb > 0.0 {
                        append_sample(
                            maps.map(*kind),
                            id,
                            capacity,
                            mb * 100.0 / denominators.total_physical_mb,
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

/// Remembered start time for `pid` within the target's family.
fn start_time_for(target: &ServiceTarget, children: &[&ChildProc], pid: u32) -> u64 {
    if pid == target.host_pid {
        return target.host_process_start_time;
    }
    children
        .iter()
        .find(|c| c.pid == pid)
        .map(|c| c.start_time)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TargetSpec, TargetThresholds};
    use parking_lot::Mutex;

    /// Probe with scripted per-pid values.
    struct ScriptedProbe {
        cpu: Mutex<HashMap<u32, f64>>,
        working_set: Mutex<HashMap<u32, f64>>,
        threads: Mutex<HashMap<u32, i64>>,
    }

    impl ScriptedProbe {
        fn new() -> Self {
            Self {
                cpu: Mutex::new(HashMap::new()),
                working_set: Mutex::new(HashMap::new()),
                threads: Mutex::new(HashMap::new()),
            }
        }
    }

    impl OsProbe for ScriptedProbe {
        fn cpu_percent(&self, pid: u32) -> f64 {
            self.cpu.lock().get(&pid).copied().unwrap_or(-1.0)
        }
        fn working_set_mb(&self, pid: u32, _: Option<&str>, _: bool) -> f64 {
            self.working_set.lock().get(&pid).copied().unwrap_or(0.0)
        }
        fn private_bytes_mb(&self, _: u32) -> f64 {
            0.0
        }
        fn handle_count(&self, _: u32) -> i64 {
            -1
        }
        fn thread_count(&self, pid: u32) -> i64 {
            self.threads.lock().get(&pid).copied().unwrap_or(0)
        }
        fn active_tcp_port_count(&self, _: u32) -> i64 {
            0
        }
        fn active_ephemeral_port_count(&self, _: u32) -> i64 {
            0
        }
        fn ephemeral_port_pct(&self, _: u32) -> f64 {
            0.0
        }
        fn ephemeral_port_range(&self) -> Option<(u16, u16)> {
            None
        }
        fn commit_limit_gb(&self) -> f64 {
            16.0
        }
        fn physical_memory_info(&self) -> crate::os_probe::MemoryInfo {
            crate::os_probe::MemoryInfo {
                total_gb: 8.0,
                used_gb: 4.0,
                used_pct: 50.0,
            }
        }
        fn os_identity(&self) -> String {
            "scripted".into()
        }
    }

    /// Tree where membership is an explicit set of (pid, name, start).
    struct ScriptedTree {
        live: Mutex<HashSet<(u32, String, u64)>>,
    }

    impl ScriptedTree {
        fn with(entries: &[(u32, &str, u64)]) -> Self {
            Self {
                live: Mutex::new(
                    entries
                        .iter()
                        .map(|(p, n, s)| (*p, n.to_string(), *s))
                        .collect(),
                ),
            }
        }
        fn kill(&self, pid: u32) {
            self.live.lock().retain(|(p, _, _)| *p != pid);
        }
    }

    impl ProcessTreeDiscovery for ScriptedTree {
        fn snapshot(&self) {}
        fn children(&self, _: u32) -> Vec<ChildProc> {
            Vec::new()
        }
        fn find_processes_by_name(&self, name: &str) -> Vec<ChildProc> {
            self.live
                .lock()
                .iter()
                .filter(|(_, n, _)| n == name)
                .map(|(p, n, s)| ChildProc {
                    pid: *p,
                    name: n.clone(),
                    start_time: *s,
                })
                .collect()
        }
        fn process_info(&self, pid: u32) -> Option<ChildProc> {
            self.live
                .lock()
                .iter()
                .find(|(p, _, _)| *p == pid)
                .map(|(p, n, s)| ChildProc {
                    pid: *p,
                    name: n.clone(),
                    start_time: *s,
                })
        }
        fn ensure_process(&self, pid: u32, name: &str, start_time: u64) -> bool {
            self.live
                .lock()
                .contains(&(pid, name.to_string(), start_time))
        }
    }

    fn target(pid: u32, children: Vec<ChildProc>, spec: &TargetSpec) -> ServiceTarget {
        ServiceTarget {
            app_name: "fabric:/App1".into(),
            app_type_name: "App1Type".into(),
            service_name: "fabric:/App1/Svc1".into(),
            service_type_name: "Svc1Type".into(),
            replica_or_instance_id: 1,
            partition_id: uuid::Uuid::nil(),
            host_pid: pid,
            host_process_name: "svc_host".into(),
            host_process_start_time: 10,
            children,
            rg_memory_limit_mb: None,
            rg_enabled: false,
            thresholds: spec.thresholds(),
        }
    }

    fn cpu_spec() -> TargetSpec {
        TargetSpec {
            cpu_warning_limit_percent: 60.0,
            cpu_error_limit_percent: 80.0,
            ..TargetSpec::default()
        }
    }

    fn settings() -> ObserverSettings {
        ObserverSettings {
            monitor_duration_secs: 0, // single window iteration
            sample_interval_ms: 1,
            ..ObserverSettings::default()
        }
    }

    #[tokio::test]
    async fn test_parent_and_child_attribution() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.cpu.lock().insert(1000, 70.0);
        probe.cpu.lock().insert(1001, 20.0);
        let tree = Arc::new(ScriptedTree::with(&[
            (1000, "svc_host", 10),
            (1001, "worker", 11),
        ]));

        let child = ChildProc {
            name: "worker".into(),
            pid: 1001,
            start_time: 11,
        };
        let t = target(1000, vec![child.clone()], &cpu_spec());
        let sampler = ResourceSampler::new(probe, tree, settings());
        let maps = MetricMaps::new();

        let sampled = sampler
            .sample_targets(std::slice::from_ref(&t), &maps, &CancellationToken::new())
            .await;
        assert_eq!(sampled, 1);

        let cpu = maps.map(MetricKind::CpuTime);
        assert!((cpu.get(&t.target_id()).unwrap().avg() - 70.0).abs() < 1e-9);
        assert!((cpu.get(&t.child_id(&child)).unwrap().avg() - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stale_parent_records_nothing() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.cpu.lock().insert(1000, 70.0);
        // The live process at pid 1000 has a different start time.
        let tree = Arc::new(ScriptedTree::with(&[(1000, "svc_host", 99)]));

        let t = target(1000, vec![], &cpu_spec());
        let sampler = ResourceSampler::new(probe, tree, settings());
        let maps = MetricMaps::new();

        let sampled = sampler
            .sample_targets(std::slice::from_ref(&t), &maps, &CancellationToken::new())
            .await;
        assert_eq!(sampled, 0);
        assert!(maps.map(MetricKind::CpuTime).get(&t.target_id()).is_none());
    }

    #[tokio::test]
    async fn test_cpu_failure_marker_is_skipped() {
        let probe = Arc::new(ScriptedProbe::new());
        // No cpu entry: the probe reports -1 for pid 1000.
        let tree = Arc::new(ScriptedTree::with(&[(1000, "svc_host", 10)]));

        let t = target(1000, vec![], &cpu_spec());
        let sampler = ResourceSampler::new(probe, tree, settings());
        let maps = MetricMaps::new();

        sampler
            .sample_targets(std::slice::from_ref(&t), &maps, &CancellationToken::new())
            .await;
        // A buffer exists (the window ran) but holds no samples.
        assert_eq!(maps.map(MetricKind::CpuTime).get(&t.target_id()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unmonitored_metric_allocates_no_buffer() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.cpu.lock().insert(1000, 50.0);
        probe.threads.lock().insert(1000, 12);
        let tree = Arc::new(ScriptedTree::with(&[(1000, "svc_host", 10)]));

        let t = target(1000, vec![], &cpu_spec());
        let sampler = ResourceSampler::new(probe, tree, settings());
        let maps = MetricMaps::new();

        sampler
            .sample_targets(std::slice::from_ref(&t), &maps, &CancellationToken::new())
            .await;
        assert!(maps.map(MetricKind::Threads).get(&t.target_id()).is_none());
        assert!(maps.map(MetricKind::WorkingSetMb).get(&t.target_id()).is_none());
    }

    #[tokio::test]
    async fn test_child_dead_at_window_start_is_excluded() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.cpu.lock().insert(1000, 70.0);
        probe.cpu.lock().insert(1001, 20.0);
        let tree = Arc::new(ScriptedTree::with(&[
            (1000, "svc_host", 10),
            (1001, "worker", 11),
        ]));
        tree.kill(1001);

        let child = ChildProc {
            name: "worker".into(),
            pid: 1001,
            start_time: 11,
        };
        let t = target(1000, vec![child.clone()], &cpu_spec());
        let sampler = ResourceSampler::new(probe, tree, settings());
        let maps = MetricMaps::new();

        sampler
            .sample_targets(std::slice::from_ref(&t), &maps, &CancellationToken::new())
            .await;
        assert!(maps.map(MetricKind::CpuTime).get(&t.target_id()).is_some());
        assert!(maps.map(MetricKind::CpuTime).get(&t.child_id(&child)).is_none());
    }

    #[test]
    fn test_effective_parallelism_clamps() {
        // Regardless of the host the test runs on, the invariants hold.
        let n = effective_parallelism(None);
        assert!(n >= 1);
        let forced = effective_parallelism(Some(8));
        assert!(forced == 1 || forced == 8);
    }
}
