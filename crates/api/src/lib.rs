//! Keel public API façade (in-process).
//!
//! Hosts hand in configuration values ([`HostValue`]) and the state they
//! persisted last time ([`ManifestState`]) and get the successor state back.
//! One plan/apply/wait cycle per identity; the host serializes work per
//! identity, the engine itself is `Send + Sync` and cheap to clone.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use keel_apply::{ApplyEngine, Plan};
use keel_convert::{build_identity, decode, encode, missing_required, untyped};
use keel_core::{
    DynamicValue, EngineConfig, Error, FieldPath, HostValue, KeelResult, ObjectName, ObservedState, ResourceIdentity,
};
use keel_diff::{extract_owned, DiffSummary};
use keel_kubehub::{Cluster, DiscoveredResource, KubeCluster, ObjectRef};
use keel_schema::{ResolvedKind, SchemaNode, SchemaRegistry};
use keel_wait::WaitController;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod adapter;

pub use crate::adapter::{delete_idempotent, ResourceAdapter, TypedAdapter};
pub use keel_wait::{AllOf, ConditionMatch, FieldsMatch, ReadinessPredicate, Rollout, WaitOutcome, WaitState, WaitTarget};

/// What the host persists per identity between cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestState {
    pub identity: ResourceIdentity,
    /// Value last applied by the engine.
    pub baseline: HostValue,
    /// Remote object at the end of the cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<HostValue>,
}

/// A computed plan, ready to apply.
#[derive(Debug, Clone)]
pub struct ManifestPlan {
    pub plan: Plan,
    schema: Arc<SchemaNode>,
}

impl ManifestPlan {
    pub fn identity(&self) -> &ResourceIdentity {
        &self.plan.identity
    }

    pub fn exists(&self) -> bool {
        self.plan.exists()
    }

    pub fn is_noop(&self) -> bool {
        self.plan.is_noop()
    }

    pub fn summary(&self) -> DiffSummary {
        self.plan.patch.summary()
    }

    pub fn set_paths(&self) -> Vec<FieldPath> {
        self.plan.patch.set_paths()
    }

    pub fn deletions(&self) -> impl Iterator<Item = &FieldPath> {
        self.plan.patch.deletions.iter()
    }

    pub fn drift(&self) -> impl Iterator<Item = &FieldPath> {
        self.plan.patch.drift.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub state: ManifestState,
    pub created: bool,
    pub changed: bool,
    /// Present when a wait was requested. A failed wait does not undo the apply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub identity: ResourceIdentity,
    pub existed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitOutcome>,
}

/// Manifest lifecycle surface.
#[async_trait::async_trait]
pub trait ManifestApi: Send + Sync {
    /// Resolve a kind (`v1/ConfigMap`, `apps/v1/Deployment`).
    async fn schema(&self, gvk_key: &str, cancel: &CancellationToken) -> KeelResult<Arc<ResolvedKind>>;

    /// Diff `desired` against the prior state and the remote object.
    async fn plan(
        &self,
        desired: &HostValue,
        prior: Option<&ManifestState>,
        cancel: &CancellationToken,
    ) -> KeelResult<ManifestPlan>;

    /// Apply a plan, then optionally wait for readiness.
    async fn apply(
        &self,
        plan: &ManifestPlan,
        wait: Option<&WaitTarget>,
        cancel: &CancellationToken,
    ) -> KeelResult<ApplyReport>;

    /// Refresh the observed object of `state`. `NotFound` when it is gone.
    async fn read(&self, state: &ManifestState, cancel: &CancellationToken) -> KeelResult<ManifestState>;

    /// Delete; a missing object counts as deleted.
    async fn delete(
        &self,
        identity: &ResourceIdentity,
        wait: bool,
        cancel: &CancellationToken,
    ) -> KeelResult<DeleteReport>;

    /// Adopt an existing object: the baseline becomes the fields this
    /// engine's field manager already owns.
    async fn import(&self, identity: &ResourceIdentity, cancel: &CancellationToken) -> KeelResult<ManifestState>;

    /// Server-side dry-run of a plan; returns the object the server would store.
    async fn dry_run(&self, plan: &ManifestPlan, cancel: &CancellationToken) -> KeelResult<HostValue>;
}

struct Inner {
    registry: SchemaRegistry,
    applier: ApplyEngine,
    waiter: WaitController,
    config: Arc<EngineConfig>,
}

/// In-process implementation of [`ManifestApi`].
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(cluster: Arc<dyn Cluster>, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let inner = Inner {
            registry: SchemaRegistry::new(cluster.clone()),
            applier: ApplyEngine::new(cluster.clone(), config.clone()),
            waiter: WaitController::new(cluster, config.wait.clone()),
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Engine against the cluster from the ambient kubeconfig.
    pub async fn connect(config: EngineConfig) -> KeelResult<Self> {
        let cluster = KubeCluster::try_default().await?;
        Ok(Self::new(Arc::new(cluster), config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    /// Identity scoped to the kind: cluster-scoped kinds drop the namespace,
    /// namespaced kinds default to `default`.
    fn scoped(identity: ResourceIdentity, resource: &DiscoveredResource) -> ResourceIdentity {
        let namespace = match (resource.namespaced, identity.namespace) {
            (false, _) => None,
            (true, Some(ns)) if !ns.is_empty() => Some(ns),
            (true, _) => Some("default".to_string()),
        };
        ResourceIdentity { namespace, ..identity }
    }

    fn object_ref(resource: &DiscoveredResource, identity: &ResourceIdentity) -> KeelResult<ObjectRef> {
        let name = identity
            .name()
            .ok_or_else(|| Error::invalid("generated name is not resolved yet").with_identity(identity))?;
        ObjectRef::new(resource, identity.namespace.as_deref(), name)
    }

    /// Fetch the current object of `identity`, if it exists.
    pub async fn get(&self, identity: &ResourceIdentity, cancel: &CancellationToken) -> KeelResult<Option<ObservedState>> {
        let resolved = self.inner.registry.resolve(&identity.gvk(), cancel).await.map_err(|e| e.with_identity(identity))?;
        let target = Self::object_ref(&resolved.resource, identity)?;
        self.inner.applier.fetch(&target, cancel).await
    }

    /// Decode a server object; shapes the schema does not describe are
    /// carried structurally instead of failing the cycle.
    fn decode_observed(schema: &SchemaNode, value: &DynamicValue, identity: &ResourceIdentity) -> HostValue {
        match decode(value, schema) {
            Ok(v) => v,
            Err(e) => {
                warn!(object = %identity, error = %e, "observed object does not match schema; keeping it untyped");
                untyped(value)
            }
        }
    }

    /// The prior baseline, if it belongs to `identity`.
    fn prior_baseline(
        schema: &SchemaNode,
        identity: &ResourceIdentity,
        prior: Option<&ManifestState>,
    ) -> KeelResult<Option<DynamicValue>> {
        let Some(prior) = prior else { return Ok(None) };
        let same = prior.identity.gvk() == identity.gvk()
            && prior.identity.namespace == identity.namespace
            && prior.identity.name == identity.name;
        if !same {
            warn!(object = %identity, previous = %prior.identity, "identity changed; planning as a new object");
            return Ok(None);
        }
        encode(&prior.baseline, schema).map(Some).map_err(|e| e.with_identity(identity))
    }
}

/// Make the desired metadata agree with the scoped identity: the defaulted
/// namespace is written out, cluster-scoped kinds lose theirs, and a resolved
/// generated name replaces `generateName`.
fn pin_metadata(desired: &mut DynamicValue, identity: &ResourceIdentity) {
    let meta = FieldPath::root().field("metadata");
    match &identity.namespace {
        Some(ns) => {
            desired.set_path(&meta.field("namespace"), DynamicValue::string(ns));
        }
        None => {
            desired.remove_path(&meta.field("namespace"));
        }
    }
    if let ObjectName::Named(name) = &identity.name {
        desired.remove_path(&meta.field("generateName"));
        desired.set_path(&meta.field("name"), DynamicValue::string(name));
    }
}

#[async_trait::async_trait]
impl ManifestApi for Engine {
    async fn schema(&self, gvk_key: &str, cancel: &CancellationToken) -> KeelResult<Arc<ResolvedKind>> {
        let gvk = keel_core::Gvk::parse_key(gvk_key)?;
        self.inner.registry.resolve(&gvk, cancel).await
    }

    async fn plan(
        &self,
        desired: &HostValue,
        prior: Option<&ManifestState>,
        cancel: &CancellationToken,
    ) -> KeelResult<ManifestPlan> {
        let t0 = Instant::now();
        let identity = build_identity(desired, None)?;
        let resolved = self.inner.registry.resolve(&identity.gvk(), cancel).await.map_err(|e| e.with_identity(&identity))?;
        let mut identity = Self::scoped(identity, &resolved.resource);
        info!(object = %identity, "api: plan start");

        let mut wire = encode(desired, &resolved.schema).map_err(|e| e.with_identity(&identity))?;
        // generated names resolve once; later cycles target the same object
        let resolved_name = match (&identity.name, prior) {
            (ObjectName::Generated(_), Some(p)) if p.identity.gvk() == identity.gvk() && p.identity.namespace == identity.namespace => {
                p.identity.name()
            }
            _ => None,
        };
        if let Some(name) = resolved_name {
            identity = identity.resolve_name(name);
        }
        pin_metadata(&mut wire, &identity);
        let baseline = Self::prior_baseline(&resolved.schema, &identity, prior)?;
        let plan = self
            .inner
            .applier
            .plan(&identity, &resolved.resource, &wire, baseline.as_ref(), cancel)
            .await?;

        if !plan.exists() {
            if let Some(path) = missing_required(&wire, &resolved.schema).into_iter().next() {
                return Err(Error::invalid_at(&path, "required field is missing").with_identity(&identity));
            }
        }
        let s = plan.patch.summary();
        info!(
            object = %identity,
            exists = plan.exists(),
            adds = s.adds,
            updates = s.updates,
            removes = s.removes,
            drift = plan.patch.drift.len(),
            took_ms = %t0.elapsed().as_millis(),
            "api: plan ok"
        );
        Ok(ManifestPlan { plan, schema: resolved.schema.clone() })
    }

    async fn apply(
        &self,
        plan: &ManifestPlan,
        wait: Option<&WaitTarget>,
        cancel: &CancellationToken,
    ) -> KeelResult<ApplyReport> {
        let applied = self.inner.applier.apply(&plan.plan, cancel).await?;
        let baseline = decode(&applied.baseline, &plan.schema).map_err(|e| e.with_identity(&applied.identity))?;
        let observed = Self::decode_observed(&plan.schema, &applied.observed.value, &applied.identity);
        let state = ManifestState { identity: applied.identity.clone(), baseline, observed: Some(observed) };

        let wait = match wait {
            Some(what) => {
                let target = Self::object_ref(&plan.plan.resource, &applied.identity)?;
                Some(self.inner.waiter.wait(&target, what, cancel).await)
            }
            None => None,
        };
        Ok(ApplyReport { state, created: applied.created, changed: applied.changed, wait })
    }

    async fn read(&self, state: &ManifestState, cancel: &CancellationToken) -> KeelResult<ManifestState> {
        let resolved =
            self.inner.registry.resolve(&state.identity.gvk(), cancel).await.map_err(|e| e.with_identity(&state.identity))?;
        let target = Self::object_ref(&resolved.resource, &state.identity)?;
        let observed = self
            .inner
            .applier
            .fetch(&target, cancel)
            .await?
            .ok_or_else(|| Error::not_found(state.identity.to_string()).with_identity(&state.identity))?;
        Ok(ManifestState {
            identity: state.identity.clone(),
            baseline: state.baseline.clone(),
            observed: Some(Self::decode_observed(&resolved.schema, &observed.value, &state.identity)),
        })
    }

    async fn delete(
        &self,
        identity: &ResourceIdentity,
        wait: bool,
        cancel: &CancellationToken,
    ) -> KeelResult<DeleteReport> {
        let resolved = self.inner.registry.resolve(&identity.gvk(), cancel).await.map_err(|e| e.with_identity(identity))?;
        let identity = Self::scoped(identity.clone(), &resolved.resource);
        let target = Self::object_ref(&resolved.resource, &identity)?;
        let existed = self.inner.applier.delete(&target, false, cancel).await?;
        let wait = if wait && existed {
            Some(self.inner.waiter.wait(&target, &WaitTarget::Deleted, cancel).await)
        } else {
            None
        };
        Ok(DeleteReport { identity, existed, wait })
    }

    async fn import(&self, identity: &ResourceIdentity, cancel: &CancellationToken) -> KeelResult<ManifestState> {
        let resolved = self.inner.registry.resolve(&identity.gvk(), cancel).await.map_err(|e| e.with_identity(identity))?;
        let identity = Self::scoped(identity.clone(), &resolved.resource);
        let target = Self::object_ref(&resolved.resource, &identity)?;
        let observed = self
            .inner
            .applier
            .fetch(&target, cancel)
            .await?
            .ok_or_else(|| Error::not_found(identity.to_string()).with_identity(&identity))?;
        let mut owned = extract_owned(&observed.value, &observed.ownership, &self.inner.config.field_manager);
        if let Some(root) = owned.as_map_mut() {
            root.shift_remove("status");
        }
        if let Some(meta) = owned.as_map_mut().and_then(|m| m.get_mut("metadata")).and_then(DynamicValue::as_map_mut) {
            meta.retain(|k, _| !matches!(k.as_str(), "uid" | "selfLink"));
        }
        let baseline = Self::decode_observed(&resolved.schema, &owned, &identity);
        info!(object = %identity, fields = ?owned.as_map().map(|m| m.len()), "api: imported");
        Ok(ManifestState {
            identity: identity.clone(),
            baseline,
            observed: Some(Self::decode_observed(&resolved.schema, &observed.value, &identity)),
        })
    }

    async fn dry_run(&self, plan: &ManifestPlan, cancel: &CancellationToken) -> KeelResult<HostValue> {
        let t0 = Instant::now();
        info!(object = %plan.identity(), "api: dry_run start");
        let obj = self.inner.applier.dry_run(&plan.plan, cancel).await?;
        info!(object = %plan.identity(), took_ms = %t0.elapsed().as_millis(), "api: dry_run ok");
        Ok(Self::decode_observed(&plan.schema, &obj, plan.identity()))
    }
}
