//! # Evaluator - Family Aggregation and Threshold Transitions
//!
//! Folds each target's sampling windows into a single family value
//! (parent average plus the sum of descendant averages), derives the
//! health state from the target's warn/error thresholds, and drives the
//! report lifecycle:
//!
//! - a non-Ok state emits a report every pass (same key, refreshed TTL),
//! - a return to Ok emits exactly one retiring Ok report,
//! - a target that was never outside Ok emits no health report at all.
//!
//! A metric telemetry event is emitted for every evaluated family value
//! regardless of threshold state - downstream dashboards see the value
//! stream, not just the exceptions.
//!
//! State derivation: `Error` when `value ≥ error && error > 0`, else
//! `Warning` when `value ≥ warn && warn > 0`, else `Ok`. Each side of a
//! threshold pair only ever drives its own state, so a warn-only
//! configuration can never produce an Error.
//!
//! After a target's metrics are evaluated, its descendant buffers are
//! removed from the metric maps and the parent buffer is dropped unless
//! the evaluator flagged it (`active_error_or_warning`), which keeps the
//! hysteresis window alive across passes.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::MetricKind;
use crate::dump::DumpManager;
use crate::health::{EntityKind, HealthReporter, HealthState};
use crate::resource_sampler::MetricMaps;
use crate::target_resolver::ServiceTarget;
use crate::telemetry::{MetricEvent, TelemetrySink};

/// Which entity threshold reports are filed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityScope {
    Node,
    Application,
    Service,
}

/// Per-pass evaluation totals, folded into observer runtime state and the
/// operational telemetry snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub evaluated: usize,
    pub warnings: usize,
    pub errors: usize,
}

/// One family value and its derived state.
#[derive(Debug, Clone)]
struct FamilyReading {
    value: f64,
    child_count: usize,
    sample_count: usize,
}

pub struct Evaluator {
    observer_name: String,
    reporter: Arc<HealthReporter>,
    sink: Arc<dyn TelemetrySink>,
    dumps: Arc<DumpManager>,
    entity_scope: EntityScope,
    run_interval: Duration,
}

impl Evaluator {
    pub fn new(
        observer_name: impl Into<String>,
        reporter: Arc<HealthReporter>,
        sink: Arc<dyn TelemetrySink>,
        dumps: Arc<DumpManager>,
        entity_scope: EntityScope,
        run_interval: Duration,
    ) -> Self {
        Self {
            observer_name: observer_name.into(),
            reporter,
            sink,
            dumps,
            entity_scope,
            run_interval,
        }
    }

    pub fn set_run_interval(&mut self, run_interval: Duration) {
        self.run_interval = run_interval;
    }

    /// Evaluate every enabled metric of every target, then garbage-collect
    /// the pass's buffers.
    pub fn evaluate_targets(&self, targets: &[ServiceTarget], maps: &MetricMaps) -> PassStats {
        let mut stats = PassStats::default();
        for target in targets {
            self.evaluate_target(target, maps, &mut stats);
            self.collect_pass_buffers(target, maps);
        }
        stats
    }

    fn evaluate_target(&self, target: &ServiceTarget, maps: &MetricMaps, stats: &mut PassStats) {
        let target_id = target.target_id();

        for metric in target.thresholds.enabled_metrics() {
            let Some(reading) = family_reading(maps, metric, &target_id) else {
                continue;
            };
            if reading.sample_count == 0 {
                continue;
            }
            stats.evaluated += 1;

            let thresholds = target.thresholds.get(metric);
            let state = derive_state(reading.value, thresholds.warn, thresholds.error);
            match state {
                HealthState::Warning => stats.warnings += 1,
                HealthState::Error => stats.errors += 1,
                HealthState::Ok => {}
            }

            // Sticky hysteresis flag on the parent buffer.
            if let Some(mut buf) = maps.map(metric).get_mut(&target_id) {
                buf.set_active_error_or_warning(state != HealthState::Ok);
            }

            self.emit_metric_telemetry(target, metric, &reading);
            self.emit_health(target, metric, &reading, state);

            if state == HealthState::Error && target.thresholds.dump_on_error
                || state == HealthState::Warning && target.thresholds.dump_on_warning
            {
                self.dumps.request(
                    target.host_pid,
                    &target.host_process_name,
                    &format!("{metric} {state} at {:.1}", reading.value),
                );
            }
        }
    }

    fn emit_metric_telemetry(
        &self,
        target: &ServiceTarget,
        metric: MetricKind,
        reading: &FamilyReading,
    ) {
        let event = MetricEvent {
            node_name: self.reporter.node_name().to_string(),
            observer: self.observer_name.clone(),
            app_name: target.app_name.clone(),
            service_name: target.service_name.clone(),
            target_id: target.target_id(),
            metric,
            value: reading.value,
            pid: target.host_pid,
            child_count: reading.child_count,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.sink.report_metric(&event) {
            debug!(error = %e, metric = %metric, "metric telemetry dropped");
        }
    }

    fn emit_health(
        &self,
        target: &ServiceTarget,
        metric: MetricKind,
        reading: &FamilyReading,
        state: HealthState,
    ) {
        let entity = match self.entity_scope {
            EntityScope::Node => EntityKind::Node,
            EntityScope::Application => EntityKind::Application(target.app_name.clone()),
            EntityScope::Service => EntityKind::Service(target.service_name.clone()),
        };
        let ttl = HealthReporter::ttl_for(self.run_interval);
        let event = self.reporter.metric_event(
            entity,
            &self.observer_name,
            metric,
            &target.app_name,
            &target.service_name,
            state,
            reading.value,
            describe(target, metric, reading.value, state, target.thresholds.get(metric)),
            ttl,
        );

        match state {
            HealthState::Ok => {
                // Only a retirement is worth a report; steady Ok is silence.
                if self.reporter.current_state(&event.key()) != HealthState::Ok {
                    self.reporter.report(event);
                }
            }
            _ => self.reporter.report(event),
        }
    }

    /// Pass-end garbage collection: descendant buffers always go; the
    /// parent buffer survives only while its sticky flag is set.
    fn collect_pass_buffers(&self, target: &ServiceTarget, maps: &MetricMaps) {
        let target_id = target.target_id();
        for metric in MetricKind::all() {
            let map = maps.map(metric);
            let keep_parent = map
                .get(&target_id)
                .map(|b| b.active_error_or_warning())
                .unwrap_or(false);
            map.retain(|id, _| {
                if !id.starts_with(&target_id) {
                    return true;
                }
                id.as_str() == target_id && keep_parent
            });
        }
    }
}

/// `parent.avg + Σ child.avg` over the family keyed under `target_id`.
/// `None` when no buffer exists for the parent or any child.
fn family_reading(maps: &MetricMaps, metric: MetricKind, target_id: &str) -> Option<FamilyReading> {
    let map = maps.map(metric);
    let mut value = 0.0;
    let mut sample_count = 0;
    let mut child_count = 0;
    let mut seen_any = false;

    for entry in map.iter() {
        let id = entry.key();
        if !id.starts_with(target_id) {
            continue;
        }
        seen_any = true;
        if entry.value().is_empty() {
            continue;
        }
        value += entry.value().avg();
        sample_count += entry.value().count();
        if id.as_str() != target_id {
            child_count += 1;
        }
    }

    seen_any.then_some(FamilyReading {
        value,
        child_count,
        sample_count,
    })
}

/// `Error` when at or over a configured error limit, else `Warning` when
/// at or over a configured warn limit, else `Ok`. An unconfigured side is
/// never consulted.
fn derive_state(value: f64, warn: Option<f64>, error: Option<f64>) -> HealthState {
    if let Some(error) = error {
        if error > 0.0 && value >= error {
            return HealthState::Error;
        }
    }
    if let Some(warn) = warn {
        if warn > 0.0 && value >= warn {
            return HealthState::Warning;
        }
    }
    HealthState::Ok
}

fn describe(
    target: &ServiceTarget,
    metric: MetricKind,
    value: f64,
    state: HealthState,
    thresholds: crate::config::ThresholdSet,
) -> String {
    match state {
        HealthState::Ok => format!(
            "{metric} for {} is back within limits at {value:.1}",
            target.service_name
        ),
        HealthState::Warning => format!(
            "{metric} for {} is {value:.1}, at or above the warning limit of {:.1}",
            target.service_name,
            thresholds.warn.unwrap_or(0.0)
        ),
        HealthState::Error => format!(
            "{metric} for {} is {value:.1}, at or above the error limit of {:.1}",
            target.service_name,
            thresholds.error.unwrap_or(0.0)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TargetSpec, ThresholdSet};
    use crate::dump::{DumpManager, NoopDumper};
    use crate::health::{HealthEvent, HealthStore};
    use crate::sample_buffer::append_sample;
    use crate::Result;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        health: Mutex<Vec<HealthEvent>>,
        metrics: Mutex<Vec<MetricEvent>>,
    }

    impl HealthStore for Recording {
        fn emit(&self, event: HealthEvent) -> Result<()> {
            self.health.lock().push(event);
            Ok(())
        }
    }

    impl TelemetrySink for Recording {
        fn report_metric(&self, event: &MetricEvent) -> Result<()> {
            self.metrics.lock().push(event.clone());
            Ok(())
        }
        fn report_health(&self, _: &HealthEvent) -> Result<()> {
            Ok(())
        }
        fn emit_event(&self, _: &str, _: serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    struct Rig {
        recording: Arc<Recording>,
        evaluator: Evaluator,
        maps: MetricMaps,
    }

    fn rig() -> Rig {
        let recording = Arc::new(Recording::default());
        let reporter = Arc::new(HealthReporter::new(
            "node-0",
            recording.clone(),
            recording.clone(),
        ));
        let evaluator = Evaluator::new(
            "AppObserver",
            reporter,
            recording.clone(),
            Arc::new(DumpManager::new(
                Arc::new(NoopDumper),
                3,
                Duration::from_secs(3600),
            )),
            EntityScope::Node,
            Duration::from_secs(60),
        );
        Rig {
            recording,
            evaluator,
            maps: MetricMaps::new(),
        }
    }

    fn cpu_target(warn: f64, error: f64) -> ServiceTarget {
        let spec = TargetSpec {
            target_app: Some("fabric:/App1".into()),
            cpu_warning_limit_percent: warn,
            cpu_error_limit_percent: error,
            ..TargetSpec::default()
        };
        ServiceTarget {
            app_name: "fabric:/App1".into(),
            app_type_name: "App1Type".into(),
            service_name: "fabric:/App1/Svc1".into(),
            service_type_name: "Svc1Type".into(),
            replica_or_instance_id: 1,
            partition_id: uuid::Uuid::nil(),
            host_pid: 1000,
            host_process_name: "svc_host".into(),
            host_process_start_time: 10,
            children: vec![],
            rg_memory_limit_mb: None,
            rg_enabled: false,
            thresholds: spec.thresholds(),
        }
    }

    #[test]
    fn test_derive_state_ladder() {
        assert_eq!(derive_state(90.0, Some(60.0), Some(80.0)), HealthState::Error);
        assert_eq!(derive_state(70.0, Some(60.0), Some(80.0)), HealthState::Warning);
        assert_eq!(derive_state(50.0, Some(60.0), Some(80.0)), HealthState::Ok);
        // An unconfigured side never fires.
        assert_eq!(derive_state(999.0, Some(60.0), None), HealthState::Warning);
        assert_eq!(derive_state(999.0, None, None), HealthState::Ok);
    }

    #[test]
    fn test_warning_emitted_with_family_value() {
        let rig = rig();
        let target = cpu_target(60.0, 80.0);
        append_sample(rig.maps.map(MetricKind::CpuTime), &target.target_id(), 8, 70.0);

        let stats = rig.evaluator.evaluate_targets(&[target], &rig.maps);
        assert_eq!(stats.warnings, 1);
        assert_eq!(stats.errors, 0);

        let health = rig.recording.health.lock();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].state, HealthState::Warning);
        assert!(health[0].property.contains("CpuTime"));
        assert!((health[0].value.unwrap() - 70.0).abs() < 1e-9);

        // The metric event is emitted regardless of state.
        assert_eq!(rig.recording.metrics.lock().len(), 1);
    }

    #[test]
    fn test_family_sum_escalates_to_error() {
        let rig = rig();
        let target = cpu_target(60.0, 80.0);
        let child = crate::process_tree::ChildProc {
            name: "worker".into(),
            pid: 1001,
            start_time: 11,
        };
        append_sample(rig.maps.map(MetricKind::CpuTime), &target.target_id(), 8, 70.0);
        append_sample(
            rig.maps.map(MetricKind::CpuTime),
            &target.child_id(&child),
            8,
            20.0,
        );

        let stats = rig.evaluator.evaluate_targets(&[target], &rig.maps);
        assert_eq!(stats.errors, 1);
        let health = rig.recording.health.lock();
        assert_eq!(health[0].state, HealthState::Error);
        assert!((health[0].value.unwrap() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_ok_below_thresholds_is_silent() {
        let rig = rig();
        let target = cpu_target(60.0, 80.0);
        append_sample(rig.maps.map(MetricKind::CpuTime), &target.target_id(), 8, 10.0);

        rig.evaluator.evaluate_targets(&[target], &rig.maps);
        assert!(rig.recording.health.lock().is_empty());
        // But the value stream still flows.
        assert_eq!(rig.recording.metrics.lock().len(), 1);
    }

    #[test]
    fn test_warning_then_ok_retires_with_same_key() {
        let rig = rig();
        let target = cpu_target(60.0, 80.0);
        let id = target.target_id();

        append_sample(rig.maps.map(MetricKind::CpuTime), &id, 8, 70.0);
        rig.evaluator.evaluate_targets(std::slice::from_ref(&target), &rig.maps);

        // Next pass: usage back to normal.
        append_sample(rig.maps.map(MetricKind::CpuTime), &id, 8, 10.0);
        rig.evaluator.evaluate_targets(std::slice::from_ref(&target), &rig.maps);

        let health = rig.recording.health.lock();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].state, HealthState::Warning);
        assert_eq!(health[1].state, HealthState::Ok);
        assert_eq!(health[0].source_id, health[1].source_id);
        assert_eq!(health[0].property, health[1].property);

        // A third quiet pass emits nothing new.
        drop(health);
        append_sample(rig.maps.map(MetricKind::CpuTime), &id, 8, 10.0);
        rig.evaluator.evaluate_targets(&[target], &rig.maps);
        assert_eq!(rig.recording.health.lock().len(), 2);
    }

    #[test]
    fn test_empty_buffer_produces_no_events() {
        let rig = rig();
        let target = cpu_target(60.0, 80.0);
        crate::sample_buffer::reset_buffer(
            rig.maps.map(MetricKind::CpuTime),
            &target.target_id(),
            8,
        );

        let stats = rig.evaluator.evaluate_targets(&[target], &rig.maps);
        assert_eq!(stats.evaluated, 0);
        assert!(rig.recording.health.lock().is_empty());
        assert!(rig.recording.metrics.lock().is_empty());
    }

    #[test]
    fn test_pass_gc_drops_children_keeps_flagged_parent() {
        let rig = rig();
        let target = cpu_target(60.0, 80.0);
        let child = crate::process_tree::ChildProc {
            name: "worker".into(),
            pid: 1001,
            start_time: 11,
        };
        let id = target.target_id();
        let child_id = target.child_id(&child);

        append_sample(rig.maps.map(MetricKind::CpuTime), &id, 8, 70.0);
        append_sample(rig.maps.map(MetricKind::CpuTime), &child_id, 8, 5.0);
        rig.evaluator.evaluate_targets(&[target], &rig.maps);

        let map = rig.maps.map(MetricKind::CpuTime);
        // Warning state: parent survives (sticky), child is collected.
        assert!(map.get(&id).is_some());
        assert!(map.get(&child_id).is_none());
    }

    #[test]
    fn test_pass_gc_drops_ok_parent() {
        let rig = rig();
        let target = cpu_target(60.0, 80.0);
        let id = target.target_id();

        append_sample(rig.maps.map(MetricKind::CpuTime), &id, 8, 10.0);
        rig.evaluator.evaluate_targets(&[target], &rig.maps);
        assert!(rig.maps.map(MetricKind::CpuTime).get(&id).is_none());
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let t = ThresholdSet::from_raw(60.0, 80.0);
        assert_eq!(derive_state(60.0, t.warn, t.error), HealthState::Warning);
        assert_eq!(derive_state(80.0, t.warn, t.error), HealthState::Error);
        assert_eq!(derive_state(59.999, t.warn, t.error), HealthState::Ok);
    }
}
