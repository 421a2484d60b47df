//! # Target Resolver - From Configured Specs to Concrete Targets
//!
//! Turns the user's target list (explicit application URIs, application
//! types, or the `*`/`all` wildcard) into the concrete [`ServiceTarget`]
//! records for the current node and pass. Targets are rebuilt from the
//! cluster runtime on every pass; nothing here survives between passes.
//!
//! ## Resolution Rules
//!
//! 1. Wildcard entries expand against the applications deployed on this
//!    node, skipping the system application and container-only
//!    applications, honoring the wildcard's app include/exclude lists.
//!    When a specific entry for the same application already exists, the
//!    wildcard only fills its unset fields - specific settings win. The
//!    wildcard entry itself is removed after expansion.
//! 2. Explicit URIs are normalized (`fabric:/` prefix, `://` collapsed,
//!    spaces stripped); entries that still fail to parse are discarded
//!    with a node-level Warning report.
//! 3. Per application, deployed replicas and instances are enumerated;
//!    stateful services contribute primaries and active secondaries.
//!    Service include/exclude lists are case-insensitive substrings
//!    matched against the leaf of the service name.
//! 4. A replica claimed by an explicit `targetApp` entry is never
//!    re-claimed by a `targetAppType` entry; among several entries for
//!    one application the first with any filter list wins, else the first.
//! 5. Replicas whose host process cannot be identified, or whose host is
//!    the platform's own runtime (or this agent), are dropped.
//! 6. Helper code packages of the same service manifest join the target
//!    as additional children; descendant processes are attached when
//!    descendant monitoring is enabled.
//! 7. Resource-governance memory limits are read from the application
//!    manifest and attached for percent-of-limit evaluation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cluster_query::{extract_rg_policy, AppRef, ClusterQuery, HostKind, Replica, ReplicaRole, ServiceKind};
use crate::config::{TargetSpec, TargetThresholds, APP_URI_SCHEME};
use crate::health::{uri_leaf, HealthReporter, HealthState};
use crate::process_tree::{ChildProc, ProcessTreeDiscovery};
use crate::Result;

/// The system application URI, never monitored through the wildcard.
pub const SYSTEM_APP_URI: &str = "fabric:/System";

/// A service replica plus its host process family, the unit of threshold
/// evaluation for one pass.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub app_name: String,
    pub app_type_name: String,
    pub service_name: String,
    pub service_type_name: String,
    pub replica_or_instance_id: i64,
    pub partition_id: uuid::Uuid,
    pub host_pid: u32,
    pub host_process_name: String,
    pub host_process_start_time: u64,
    pub children: Vec<ChildProc>,
    pub rg_memory_limit_mb: Option<f64>,
    pub rg_enabled: bool,
    pub thresholds: TargetThresholds,
}

impl ServiceTarget {
    /// Stable parent identity: `"{app}:{procName}{pid}"`. Child ids extend
    /// this prefix, so `starts_with(target_id)` defines the family.
    pub fn target_id(&self) -> String {
        format!(
            "{}:{}{}",
            self.app_name, self.host_process_name, self.host_pid
        )
    }

    pub fn child_id(&self, child: &ChildProc) -> String {
        format!("{}:{}{}", self.target_id(), child.name, child.pid)
    }
}

/// Normalize a configured application URI.
///
/// Prefixes the platform scheme when missing, collapses `://` to `:/`,
/// strips all whitespace. Returns `None` when the result is still not a
/// well-formed application URI.
pub fn normalize_app_uri(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let prefixed = if compact.contains(':') {
        compact
    } else {
        format!("{APP_URI_SCHEME}/{}", compact.trim_start_matches('/'))
    };
    let collapsed = prefixed.replace(":///", ":/").replace("://", ":/");

    let rest = collapsed.strip_prefix(&format!("{APP_URI_SCHEME}/"))?;
    if rest.is_empty() || rest.starts_with('/') || rest.contains("//") {
        return None;
    }
    Some(collapsed)
}

/// Case-insensitive substring filter over a name leaf.
fn leaf_allowed(leaf: &str, include: &[String], exclude: &[String]) -> bool {
    let leaf = leaf.to_lowercase();
    if exclude.iter().any(|e| leaf.contains(e)) {
        return false;
    }
    if !include.is_empty() && !include.iter().any(|i| leaf.contains(i)) {
        return false;
    }
    true
}

/// Resolves configured target specs into concrete service targets.
pub struct TargetResolver {
    observer_name: String,
    cluster: Arc<dyn ClusterQuery>,
    tree: Arc<dyn ProcessTreeDiscovery>,
    reporter: Arc<HealthReporter>,
    /// Process names of the platform runtime itself; replicas hosted by
    /// these are never monitored.
    platform_process_names: Vec<String>,
    monitor_descendants: bool,
}

impl TargetResolver {
    pub fn new(
        observer_name: impl Into<String>,
        cluster: Arc<dyn ClusterQuery>,
        tree: Arc<dyn ProcessTreeDiscovery>,
        reporter: Arc<HealthReporter>,
        platform_process_names: Vec<String>,
        monitor_descendants: bool,
    ) -> Self {
        Self {
            observer_name: observer_name.into(),
            cluster,
            tree,
            reporter,
            platform_process_names,
            monitor_descendants,
        }
    }

    /// Resolve the effective target list for this pass.
    pub async fn resolve(&self, specs: &[TargetSpec]) -> Result<Vec<ServiceTarget>> {
        self.tree.snapshot();

        let node = self.reporter.node_name().to_string();
        let deployed = self.cluster.list_deployed_apps(&node).await?;
        let deployed_by_name: HashMap<String, &AppRef> =
            deployed.iter().map(|a| (a.app_name.clone(), a)).collect();

        let specs = self.expand_wildcards(specs, &deployed).await;
        let specs = self.normalize_specs(specs);

        // Explicit-app entries claim replicas before type-scoped entries.
        let (app_specs, type_specs): (Vec<_>, Vec<_>) = specs
            .into_iter()
            .partition(|s| s.target_app.is_some());

        let mut targets = Vec::new();
        let mut claimed: HashSet<(uuid::Uuid, i64)> = HashSet::new();

        for spec in app_specs.iter().chain(type_specs.iter()) {
            let apps: Vec<&AppRef> = match (&spec.target_app, &spec.target_app_type) {
                (Some(app), _) => deployed_by_name.get(app).into_iter().copied().collect(),
                (None, Some(ty)) => deployed
                    .iter()
                    .filter(|a| a.app_type_name == *ty)
                    .collect(),
                (None, None) => Vec::new(),
            };

            for app in apps {
                match self
                    .resolve_app(&node, app, spec, &mut claimed)
                    .await
                {
                    Ok(mut resolved) => targets.append(&mut resolved),
                    Err(e) => {
                        // One unqueryable application never fails the pass.
                        warn!(app = %app.app_name, error = %e, "skipping unresolvable application");
                    }
                }
            }
        }

        debug!(
            observer = %self.observer_name,
            targets = targets.len(),
            "target resolution complete"
        );
        Ok(targets)
    }

    /// Expand `*`/`all` entries per the merge rules, dropping the wildcard
    /// afterwards. Later duplicate entries for one application are reduced
    /// by the first-with-filters-else-first tie-break.
    async fn expand_wildcards(
        &self,
        specs: &[TargetSpec],
        deployed: &[AppRef],
    ) -> Vec<TargetSpec> {
        let mut specific: Vec<TargetSpec> =
            specs.iter().filter(|s| !s.is_wildcard()).cloned().collect();

        for wildcard in specs.iter().filter(|s| s.is_wildcard()) {
            let thresholds = wildcard.thresholds();
            for app in deployed {
                if app.app_name == SYSTEM_APP_URI {
                    continue;
                }
                if !leaf_allowed(
                    uri_leaf(&app.app_name),
                    &thresholds.app_include,
                    &thresholds.app_exclude,
                ) {
                    continue;
                }
                if self.is_container_only(app).await {
                    continue;
                }

                let existing = specific.iter_mut().find(|s| {
                    s.target_app.as_deref() == Some(app.app_name.as_str())
                        || (s.target_app.is_none()
                            && s.target_app_type.as_deref() == Some(app.app_type_name.as_str()))
                });
                match existing {
                    Some(spec) => spec.merge_from_wildcard(wildcard),
                    None => {
                        let mut spec = wildcard.clone();
                        spec.target_app = Some(app.app_name.clone());
                        specific.push(spec);
                    }
                }
            }
        }

        dedupe_specs(specific)
    }

    /// True when every code package of the application is container
    /// hosted; such applications are skipped by wildcard expansion.
    async fn is_container_only(&self, app: &AppRef) -> bool {
        let node = self.reporter.node_name();
        match self
            .cluster
            .list_deployed_code_packages(node, &app.app_name, "")
            .await
        {
            Ok(packages) if !packages.is_empty() => packages
                .iter()
                .all(|p| p.host_kind == HostKind::ContainerHost),
            _ => false,
        }
    }

    /// Normalize explicit URIs; discard malformed entries with a Warning.
    fn normalize_specs(&self, specs: Vec<TargetSpec>) -> Vec<TargetSpec> {
        specs
            .into_iter()
            .filter_map(|mut spec| {
                let Some(raw) = spec.target_app.clone() else {
                    return Some(spec);
                };
                match normalize_app_uri(&raw) {
                    Some(uri) => {
                        spec.target_app = Some(uri);
                        Some(spec)
                    }
                    None => {
                        self.reporter.node_report(
                            &self.observer_name,
                            "Config",
                            format!("TargetUri:{raw}"),
                            HealthState::Warning,
                            format!("target application URI '{raw}' is not well-formed; entry ignored"),
                            Duration::from_secs(300),
                        );
                        None
                    }
                }
            })
            .collect()
    }

    async fn resolve_app(
        &self,
        node: &str,
        app: &AppRef,
        spec: &TargetSpec,
        claimed: &mut HashSet<(uuid::Uuid, i64)>,
    ) -> Result<Vec<ServiceTarget>> {
        let thresholds = spec.thresholds();
        let replicas = self.cluster.list_deployed_replicas(node, &app.app_name).await?;

        let mut targets = Vec::new();
        for replica in replicas {
            if !replica_in_scope(&replica) {
                continue;
            }
            if !leaf_allowed(
                uri_leaf(&replica.service_name),
                &thresholds.service_include,
                &thresholds.service_exclude,
            ) {
                continue;
            }
            let key = (replica.partition_id, replica.replica_or_instance_id);
            if !claimed.insert(key) {
                continue;
            }

            let Some(host) = self.identify_host(&replica) else {
                continue;
            };

            let children = self.gather_children(node, app, &replica, host.pid).await;
            let rg = self.rg_policy(app, &replica).await;

            targets.push(ServiceTarget {
                app_name: app.app_name.clone(),
                app_type_name: app.app_type_name.clone(),
                service_name: replica.service_name.clone(),
                service_type_name: replica.service_type_name.clone(),
                replica_or_instance_id: replica.replica_or_instance_id,
                partition_id: replica.partition_id,
                host_pid: host.pid,
                host_process_name: host.name,
                host_process_start_time: host.start_time,
                children,
                rg_memory_limit_mb: rg.map(|p| p.memory_limit_mb),
                rg_enabled: rg.map(|p| p.memory_enabled).unwrap_or(false),
                thresholds: thresholds.clone(),
            });
        }
        Ok(targets)
    }

    /// Resolve the host process, dropping platform-owned hosts.
    fn identify_host(&self, replica: &Replica) -> Option<ChildProc> {
        if replica.host_pid == 0 {
            return None;
        }
        let info = self.tree.process_info(replica.host_pid)?;
        if replica.host_pid == std::process::id() {
            return None;
        }
        let name = info.name.to_lowercase();
        if self
            .platform_process_names
            .iter()
            .any(|p| name == p.to_lowercase())
        {
            debug!(pid = replica.host_pid, "replica hosted by the platform runtime; skipped");
            return None;
        }
        Some(info)
    }

    /// Descendants plus helper code packages of the same service manifest.
    async fn gather_children(
        &self,
        node: &str,
        app: &AppRef,
        replica: &Replica,
        host_pid: u32,
    ) -> Vec<ChildProc> {
        let mut children = if self.monitor_descendants {
            self.tree.children(host_pid)
        } else {
            Vec::new()
        };

        if let Ok(packages) = self
            .cluster
            .list_deployed_code_packages(node, &app.app_name, &replica.service_manifest_name)
            .await
        {
            for package in packages {
                let Some(pid) = package.pid else { continue };
                if pid == host_pid || package.host_kind == HostKind::ContainerHost {
                    continue;
                }
                if children.iter().any(|c| c.pid == pid) {
                    continue;
                }
                if let Some(info) = self.tree.process_info(pid) {
                    children.push(info);
                }
            }
        }
        children
    }

    async fn rg_policy(
        &self,
        app: &AppRef,
        replica: &Replica,
    ) -> Option<crate::cluster_query::RgPolicy> {
        let manifest = self
            .cluster
            .application_manifest(&app.app_type_name, &app.app_type_version)
            .await
            .ok()?;
        extract_rg_policy(
            &manifest,
            &replica.service_manifest_name,
            &replica.code_package_name,
            &app.parameters,
        )
        .unwrap_or_else(|e| {
            warn!(app = %app.app_name, error = %e, "resource governance extraction failed");
            None
        })
    }
}

/// Stateful replicas contribute primaries and active secondaries;
/// stateless instances always contribute.
fn replica_in_scope(replica: &Replica) -> bool {
    match replica.service_kind {
        ServiceKind::Stateless => true,
        ServiceKind::Stateful => matches!(
            replica.role,
            Some(ReplicaRole::Primary) | Some(ReplicaRole::ActiveSecondary)
        ),
    }
}

/// Reduce duplicate entries for one application: the first entry with any
/// filter list wins, otherwise the first entry.
fn dedupe_specs(specs: Vec<TargetSpec>) -> Vec<TargetSpec> {
    let mut result: Vec<TargetSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
        let dup = result.iter().position(|s| {
            s.target_app.is_some() && s.target_app == spec.target_app
                || (s.target_app.is_none()
                    && spec.target_app.is_none()
                    && s.target_app_type == spec.target_app_type)
        });
        match dup {
            None => result.push(spec),
            Some(i) => {
                if !result[i].has_any_filter() && spec.has_any_filter() {
                    result[i] = spec;
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetSpec;

    #[test]
    fn test_normalize_app_uri() {
        assert_eq!(
            normalize_app_uri("fabric:/App1"),
            Some("fabric:/App1".to_string())
        );
        assert_eq!(
            normalize_app_uri("App1"),
            Some("fabric:/App1".to_string())
        );
        assert_eq!(
            normalize_app_uri("fabric://App1"),
            Some("fabric:/App1".to_string())
        );
        assert_eq!(
            normalize_app_uri(" fabric:/My App "),
            Some("fabric:/MyApp".to_string())
        );
        assert_eq!(normalize_app_uri(""), None);
        assert_eq!(normalize_app_uri("fabric:/"), None);
        assert_eq!(normalize_app_uri("http://App1"), None);
    }

    #[test]
    fn test_leaf_filtering() {
        let include = vec!["svc".to_string()];
        let exclude = vec!["janitor".to_string()];
        assert!(leaf_allowed("MySvc1", &include, &exclude));
        assert!(!leaf_allowed("JanitorSvc", &include, &exclude));
        assert!(!leaf_allowed("Worker", &include, &exclude));
        assert!(leaf_allowed("anything", &[], &[]));
    }

    #[test]
    fn test_replica_scope() {
        let mut replica = Replica {
            app_name: "fabric:/A".into(),
            service_name: "fabric:/A/S".into(),
            service_type_name: "SType".into(),
            service_kind: ServiceKind::Stateful,
            role: Some(ReplicaRole::Primary),
            replica_or_instance_id: 1,
            partition_id: uuid::Uuid::nil(),
            host_pid: 100,
            service_manifest_name: "Pkg".into(),
            code_package_name: "Code".into(),
        };
        assert!(replica_in_scope(&replica));
        replica.role = Some(ReplicaRole::ActiveSecondary);
        assert!(replica_in_scope(&replica));
        replica.role = Some(ReplicaRole::IdleSecondary);
        assert!(!replica_in_scope(&replica));
        replica.service_kind = ServiceKind::Stateless;
        replica.role = None;
        assert!(replica_in_scope(&replica));
    }

    #[test]
    fn test_dedupe_prefers_filtered_entry() {
        let plain = TargetSpec {
            target_app: Some("fabric:/App1".into()),
            ..TargetSpec::default()
        };
        let filtered = TargetSpec {
            target_app: Some("fabric:/App1".into()),
            service_exclude_list: Some("Noisy".into()),
            ..TargetSpec::default()
        };
        let out = dedupe_specs(vec![plain.clone(), filtered.clone()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].service_exclude_list.as_deref(), Some("Noisy"));

        // Two unfiltered entries: the first wins.
        let out = dedupe_specs(vec![plain.clone(), plain]);
        assert_eq!(out.len(), 1);
        assert!(!out[0].has_any_filter());
    }

    #[test]
    fn test_target_and_child_ids_share_prefix() {
        let target = ServiceTarget {
            app_name: "fabric:/App1".into(),
            app_type_name: "App1Type".into(),
            service_name: "fabric:/App1/Svc1".into(),
            service_type_name: "Svc1Type".into(),
            replica_or_instance_id: 7,
            partition_id: uuid::Uuid::nil(),
            host_pid: 1000,
            host_process_name: "svc_host".into(),
            host_process_start_time: 42,
            children: vec![],
            rg_memory_limit_mb: None,
            rg_enabled: false,
            thresholds: TargetThresholds::default(),
        };
        let child = ChildProc {
            name: "worker".into(),
            pid: 1001,
            start_time: 43,
        };
        assert_eq!(target.target_id(), "fabric:/App1:svc_host1000");
        assert!(target.child_id(&child).starts_with(&target.target_id()));
    }
}
