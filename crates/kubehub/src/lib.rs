//! Keel kubehub: the remote API boundary.
//!
//! Every remote interaction of the engine goes through [`Cluster`]. The
//! kube-rs backed [`KubeCluster`] talks to a real API server;
//! [`MemoryCluster`] simulates one (including server-side apply field
//! ownership) for tests and offline planning.

#![forbid(unsafe_code)]

use std::future::Future;

use async_trait::async_trait;
use keel_core::{DynamicValue, Error, ErrorKind, FieldConflict, FieldPath, Gvk, KeelResult, ObjectName, ResourceIdentity};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

mod memory;
mod remote;

pub use crate::memory::MemoryCluster;
pub use crate::remote::{get_kube_client, KubeCluster};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// URL path segment (`deployments`).
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk(&self) -> Gvk {
        Gvk::new(&self.group, &self.version, &self.kind)
    }

    pub fn gvk_key(&self) -> String {
        self.gvk().key()
    }

    pub fn api_version(&self) -> String {
        self.gvk().api_version()
    }
}

/// Schema material as published by the server for one kind.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSchema {
    /// Whole OpenAPI v3 document of the kind's group-version.
    OpenApiV3(serde_json::Value),
    /// `openAPIV3Schema` of the matching CRD version (no `$ref`s).
    Crd(serde_json::Value),
    /// The kind is served but publishes no schema.
    Missing,
}

/// Address of one named object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub resource: DiscoveredResource,
    /// Always `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(resource: &DiscoveredResource, namespace: Option<&str>, name: &str) -> KeelResult<Self> {
        if name.is_empty() {
            return Err(Error::invalid("object name must not be empty"));
        }
        let namespace = scoped_namespace(resource, namespace)?;
        Ok(Self { resource: resource.clone(), namespace, name: name.to_string() })
    }

    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(&self.resource.gvk(), self.namespace.as_deref(), ObjectName::Named(self.name.clone()))
    }
}

/// Namespace to use for `resource`: required for namespaced kinds, dropped
/// for cluster-scoped ones.
pub fn scoped_namespace(resource: &DiscoveredResource, namespace: Option<&str>) -> KeelResult<Option<String>> {
    match (resource.namespaced, namespace.filter(|n| !n.is_empty())) {
        (true, Some(ns)) => Ok(Some(ns.to_string())),
        (true, None) => Err(Error::invalid(format!("namespace required for namespaced kind {}", resource.gvk_key()))),
        (false, _) => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteParams {
    pub field_manager: String,
    /// Take ownership of conflicting fields (server-side apply only).
    pub force: bool,
    pub dry_run: bool,
}

/// Remote API surface used by the engine. Read methods return full objects
/// including `metadata.managedFields`.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Resolve a kind. Fails with `UnknownKind` when the server does not serve
    /// it and `DiscoveryUnavailable` when discovery itself fails.
    async fn discover(&self, gvk: &Gvk) -> KeelResult<DiscoveredResource>;

    async fn fetch_schema(&self, resource: &DiscoveredResource) -> KeelResult<RawSchema>;

    /// `Ok(None)` when the object does not exist.
    async fn get(&self, target: &ObjectRef) -> KeelResult<Option<DynamicValue>>;

    /// Server-side apply of a full apply configuration.
    async fn apply(&self, target: &ObjectRef, body: &DynamicValue, params: &WriteParams) -> KeelResult<DynamicValue>;

    /// RFC 7386 merge patch; `NotFound` when the object is absent.
    async fn merge_patch(&self, target: &ObjectRef, patch: &DynamicValue, params: &WriteParams) -> KeelResult<DynamicValue>;

    /// POST; the only way to resolve `metadata.generateName`.
    async fn create(
        &self,
        resource: &DiscoveredResource,
        namespace: Option<&str>,
        body: &DynamicValue,
        params: &WriteParams,
    ) -> KeelResult<DynamicValue>;

    /// Returns whether the object existed.
    async fn delete(&self, target: &ObjectRef, dry_run: bool) -> KeelResult<bool>;
}

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> KeelResult<T>
where
    F: Future<Output = KeelResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ErrorKind::Cancelled.into()),
        res = fut => res,
    }
}

/// Parse the field list out of a server-side apply conflict message.
///
/// Handles both shapes the API server produces:
///
/// ```text
/// Apply failed with 1 conflict: conflict with "hpa" using apps/v1: .spec.replicas
/// Apply failed with 2 conflicts: conflicts with "hpa" using apps/v1:
/// - .spec.replicas
/// - .spec.template.spec.containers[name="app"].image
/// ```
pub fn parse_apply_conflicts(message: &str) -> Vec<FieldConflict> {
    let Some(header) = conflict_header() else { return Vec::new() };
    let mut out = Vec::new();
    let mut manager: Option<String> = None;
    for line in message.lines() {
        let line = line.trim();
        if let Some(caps) = header.captures(line) {
            let m = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let tail = caps.get(2).map(|t| t.as_str().trim()).unwrap_or("");
            if !tail.is_empty() {
                out.push(FieldConflict { path: server_path(tail), manager: m.clone() });
            }
            manager = Some(m);
        } else if let (Some(path), Some(m)) = (line.strip_prefix("- "), manager.as_ref()) {
            out.push(FieldConflict { path: server_path(path.trim()), manager: m.clone() });
        }
    }
    out
}

fn conflict_header() -> Option<&'static regex::Regex> {
    static RE: std::sync::OnceLock<Option<regex::Regex>> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r#"conflicts? with "([^"]+)"(?: using [^\s:]+)?:\s*(.*)$"#).ok())
        .as_ref()
}

fn server_path(raw: &str) -> FieldPath {
    FieldPath::parse(raw).unwrap_or_else(|_| std::iter::once(keel_core::PathSegment::Field(raw.to_string())).collect())
}

/// Map an HTTP status from the API server onto the engine's error kinds.
pub fn status_error(code: u16, reason: &str, message: &str, what: &str, manager: &str) -> Error {
    match code {
        404 => Error::not_found(what),
        409 if message.starts_with("Apply failed with") => {
            let conflicts = parse_apply_conflicts(message);
            if conflicts.is_empty() {
                ErrorKind::Remote { code, message: message.to_string() }.into()
            } else {
                ErrorKind::Conflict { manager: manager.to_string(), conflicts }.into()
            }
        }
        _ => ErrorKind::Remote {
            code,
            message: if reason.is_empty() { message.to_string() } else { format!("{reason}: {message}") },
        }
        .into(),
    }
}
