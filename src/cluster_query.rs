//! # Cluster Query - Cluster Runtime Boundary
//!
//! The narrow interface over the cluster runtime: which applications and
//! replicas are deployed on this node, which processes host them, what the
//! application manifest declares, and how far upgrades have progressed.
//!
//! A production implementation wraps the platform's query client; the
//! engine only depends on the trait. All operations are async because the
//! real surface is an RPC client with its own timeouts.
//!
//! ## Resource Governance Extraction
//!
//! [`extract_rg_policy`] parses the application-manifest XML and locates
//! the `ResourceGovernancePolicy` element for a given service manifest and
//! code package. Memory limits may be parameterized (`[MemoryLimit]`);
//! placeholders are substituted from the application's parameter overrides
//! first and the manifest's declared defaults second. A manifest without a
//! matching policy yields `None`, which the resolver treats as
//! "governance disabled" for that target.

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ObserverAgentError, Result};

/// An application deployed on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRef {
    /// Application URI, e.g. `fabric:/MyApp`.
    pub app_name: String,
    pub app_type_name: String,
    pub app_type_version: String,
    /// Parameter overrides supplied at application creation.
    pub parameters: HashMap<String, String>,
}

/// Service replica model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    Stateful,
    Stateless,
}

/// Role of a stateful replica. Stateless instances carry no role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Primary,
    ActiveSecondary,
    IdleSecondary,
}

/// A deployed replica or instance, distinct by host pid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub app_name: String,
    /// Full service URI, e.g. `fabric:/MyApp/Svc1`.
    pub service_name: String,
    pub service_type_name: String,
    pub service_kind: ServiceKind,
    pub role: Option<ReplicaRole>,
    pub replica_or_instance_id: i64,
    pub partition_id: uuid::Uuid,
    pub host_pid: u32,
    pub service_manifest_name: String,
    pub code_package_name: String,
}

/// How a code package is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostKind {
    ExeHost,
    ContainerHost,
}

/// A deployed code package of a service manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodePackage {
    pub name: String,
    pub service_manifest_name: String,
    pub host_kind: HostKind,
    /// Host process, when the package is running.
    pub pid: Option<u32>,
}

/// Upgrade state of the cluster or one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeState {
    NotUpgrading,
    RollingForward,
    RollingBack,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeProgress {
    pub state: UpgradeState,
    pub target_version: Option<String>,
    pub current_domain: Option<String>,
}

/// Resource-governance memory policy for one code package.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RgPolicy {
    pub memory_enabled: bool,
    pub memory_limit_mb: f64,
}

/// Queries over the cluster runtime. Implementations must be safe under
/// concurrent use; observers share one client.
#[async_trait]
pub trait ClusterQuery: Send + Sync {
    /// Applications deployed on `node_name`.
    async fn list_deployed_apps(&self, node_name: &str) -> Result<Vec<AppRef>>;

    /// Replicas and instances of `app_uri` deployed on `node_name`,
    /// stateful and stateless alike.
    async fn list_deployed_replicas(&self, node_name: &str, app_uri: &str)
        -> Result<Vec<Replica>>;

    /// Code packages of `service_manifest` deployed for `app_uri` on this
    /// node, including helper packages.
    async fn list_deployed_code_packages(
        &self,
        node_name: &str,
        app_uri: &str,
        service_manifest: &str,
    ) -> Result<Vec<CodePackage>>;

    /// Raw application-manifest XML for an application type.
    async fn application_manifest(
        &self,
        app_type_name: &str,
        app_type_version: &str,
    ) -> Result<String>;

    async fn application_upgrade_progress(&self, app_uri: &str) -> Result<UpgradeProgress>;

    async fn cluster_upgrade_progress(&self) -> Result<UpgradeProgress>;
}

/// Extract the resource-governance memory policy for
/// `(service_manifest_name, code_package_name)` from application-manifest
/// XML.
///
/// Placeholder values (`[ParamName]`) resolve against `app_parameters`
/// first, then the manifest's own `<Parameter DefaultValue=...>`
/// declarations. Returns `Ok(None)` when the manifest declares no matching
/// policy.
pub fn extract_rg_policy(
    manifest_xml: &str,
    service_manifest_name: &str,
    code_package_name: &str,
    app_parameters: &HashMap<String, String>,
) -> Result<Option<RgPolicy>> {
    let mut reader = Reader::from_str(manifest_xml);

    let mut default_parameters: HashMap<String, String> = HashMap::new();
    let mut in_import = false;
    let mut import_manifest_name: Option<String> = None;
    let mut raw_limit: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                match e.local_name().as_ref() {
                    b"Parameter" => {
                        let mut name = None;
                        let mut default = None;
                        for attr in e.attributes().flatten() {
                            let value = attr
                                .unescape_value()
                                .map_err(|err| {
                                    ObserverAgentError::ManifestParse(err.to_string())
                                })?
                                .into_owned();
                            match attr.key.as_ref() {
                                b"Name" => name = Some(value),
                                b"DefaultValue" => default = Some(value),
                                _ => {}
                            }
                        }
                        if let (Some(name), Some(default)) = (name, default) {
                            default_parameters.insert(name, default);
                        }
                    }
                    b"ServiceManifestImport" => {
                        in_import = true;
                        import_manifest_name = None;
                    }
                    b"ServiceManifestRef" if in_import => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"ServiceManifestName" {
                                import_manifest_name = attr
                                    .unescape_value()
                                    .ok()
                                    .map(|v| v.into_owned());
                            }
                        }
                    }
                    b"ResourceGovernancePolicy"
                        if in_import
                            && import_manifest_name.as_deref() == Some(service_manifest_name) =>
                    {
                        let mut code_ref = None;
                        let mut memory = None;
                        for attr in e.attributes().flatten() {
                            let value = attr
                                .unescape_value()
                                .map_err(|err| {
                                    ObserverAgentError::ManifestParse(err.to_string())
                                })?
                                .into_owned();
                            match attr.key.as_ref() {
                                b"CodePackageRef" => code_ref = Some(value),
                                b"MemoryInMB" | b"MemoryInMBLimit" => memory = Some(value),
                                _ => {}
                            }
                        }
                        if code_ref.as_deref() == Some(code_package_name) {
                            raw_limit = memory;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"ServiceManifestImport" {
                    in_import = false;
                    import_manifest_name = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(ObserverAgentError::ManifestParse(format!(
                    "application manifest at byte {}: {err}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
    }

    let Some(raw) = raw_limit else {
        return Ok(None);
    };

    let resolved = resolve_placeholder(&raw, app_parameters, &default_parameters);
    let limit_mb: f64 = match resolved.trim().parse() {
        Ok(v) => v,
        // A placeholder with no binding anywhere means governance is
        // declared but unset for this deployment.
        Err(_) => return Ok(None),
    };

    Ok(Some(RgPolicy {
        memory_enabled: limit_mb > 0.0,
        memory_limit_mb: limit_mb,
    }))
}

/// Substitute a `[ParamName]` placeholder: application overrides win over
/// manifest defaults; a literal passes through untouched.
fn resolve_placeholder(
    raw: &str,
    app_parameters: &HashMap<String, String>,
    defaults: &HashMap<String, String>,
) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('[') && trimmed.ends_with(']') {
        let key = &trimmed[1..trimmed.len() - 1];
        if let Some(v) = app_parameters.get(key) {
            return v.clone();
        }
        if let Some(v) = defaults.get(key) {
            return v.clone();
        }
        return String::new();
    }
    trimmed.to_string()
}
