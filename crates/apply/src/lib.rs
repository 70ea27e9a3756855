//! Keel apply engine: turns a planned [`Patch`] into remote writes.
//!
//! Server-side apply (default) submits the whole apply configuration under
//! the engine's field manager, so fields the engine stopped declaring are
//! released by omission. Merge-patch submits the minimal RFC 7386 body.
//! Either way the resulting object is fetched back as the new
//! [`ObservedState`] and the plan's next baseline becomes the baseline.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use keel_core::{
    ApplyStrategy, Baseline, DynamicValue, EngineConfig, Error, KeelResult, ObjectName, ObservedState, ResourceIdentity,
};
use keel_diff::{diff, Patch};
use keel_kubehub::{cancellable, Cluster, DiscoveredResource, ObjectRef, WriteParams};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Remove server bookkeeping that never takes part in a diff.
pub fn strip_noisy(mut v: DynamicValue) -> DynamicValue {
    if let Some(meta) = v.as_map_mut().and_then(|m| m.get_mut("metadata")).and_then(DynamicValue::as_map_mut) {
        meta.shift_remove("managedFields");
        meta.shift_remove("resourceVersion");
        meta.shift_remove("generation");
        meta.shift_remove("creationTimestamp");
    }
    v
}

/// Make sure the body names the object it is sent to.
fn ensure_metadata(v: &mut DynamicValue, identity: &ResourceIdentity) {
    let gvk = identity.gvk();
    if let Some(m) = v.as_map_mut() {
        m.insert("apiVersion".into(), DynamicValue::string(gvk.api_version()));
        m.insert("kind".into(), DynamicValue::string(&gvk.kind));
    } else {
        return;
    }
    let meta = v
        .as_map_mut()
        .map(|m| m.entry("metadata".to_string()).or_insert_with(DynamicValue::map));
    if let Some(meta) = meta {
        if meta.is_null() {
            *meta = DynamicValue::map();
        }
        if let Some(obj) = meta.as_map_mut() {
            match &identity.name {
                ObjectName::Named(n) => {
                    obj.insert("name".into(), DynamicValue::string(n));
                    obj.shift_remove("generateName");
                }
                ObjectName::Generated(prefix) => {
                    obj.insert("generateName".into(), DynamicValue::string(prefix));
                }
            }
            match &identity.namespace {
                Some(ns) => {
                    obj.insert("namespace".into(), DynamicValue::string(ns));
                }
                None => {
                    obj.shift_remove("namespace");
                }
            }
        }
    }
}

/// Everything needed to apply one identity: computed by [`ApplyEngine::plan`]
/// and consumed by [`ApplyEngine::apply`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub identity: ResourceIdentity,
    #[serde(skip)]
    pub resource: DiscoveredResource,
    pub patch: Patch,
    /// Observed object at plan time; `None` when it does not exist yet.
    pub observed: Option<ObservedState>,
}

impl Plan {
    pub fn exists(&self) -> bool {
        self.observed.is_some()
    }

    /// True when applying would not touch the remote object.
    pub fn is_noop(&self) -> bool {
        self.exists() && self.patch.is_empty()
    }
}

/// Outcome of a successful apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Applied {
    /// With generated names resolved.
    pub identity: ResourceIdentity,
    pub observed: ObservedState,
    pub baseline: Baseline,
    pub created: bool,
    pub changed: bool,
}

#[derive(Clone)]
pub struct ApplyEngine {
    cluster: Arc<dyn Cluster>,
    config: Arc<EngineConfig>,
}

impl ApplyEngine {
    pub fn new(cluster: Arc<dyn Cluster>, config: Arc<EngineConfig>) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn params(&self, dry_run: bool) -> WriteParams {
        WriteParams {
            field_manager: self.config.field_manager.clone(),
            force: self.config.force_conflicts,
            dry_run,
        }
    }

    fn target(resource: &DiscoveredResource, identity: &ResourceIdentity) -> KeelResult<Option<ObjectRef>> {
        match identity.name() {
            Some(name) => ObjectRef::new(resource, identity.namespace.as_deref(), name).map(Some),
            None => Ok(None),
        }
    }

    /// Current object, without managed-field noise.
    pub async fn fetch(&self, target: &ObjectRef, cancel: &CancellationToken) -> KeelResult<Option<ObservedState>> {
        let raw = cancellable(cancel, self.cluster.get(target))
            .await
            .map_err(|e| e.with_identity(&target.identity()))?;
        Ok(raw.map(observe))
    }

    /// Fetch the observed object and diff `desired` against `baseline`.
    pub async fn plan(
        &self,
        identity: &ResourceIdentity,
        resource: &DiscoveredResource,
        desired: &DynamicValue,
        baseline: Option<&Baseline>,
        cancel: &CancellationToken,
    ) -> KeelResult<Plan> {
        let observed = match Self::target(resource, identity)? {
            Some(t) => self.fetch(&t, cancel).await?,
            None => None,
        };
        if baseline.is_some() && observed.is_none() && !identity.is_generated() {
            warn!(object = %identity, "object missing remotely; planning a create");
        }
        let patch = diff(baseline, desired, observed.as_ref(), &self.config.field_manager);
        debug!(object = %identity, exists = observed.is_some(), empty = patch.is_empty(), "planned");
        Ok(Plan { identity: identity.clone(), resource: resource.clone(), patch, observed })
    }

    /// Execute `plan`. On `Conflict` nothing changes remotely and the caller
    /// keeps its old baseline.
    pub async fn apply(&self, plan: &Plan, cancel: &CancellationToken) -> KeelResult<Applied> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);
        info!(object = %plan.identity, strategy = ?self.config.strategy, "apply start");
        let res = self.apply_inner(plan, cancel).await.map_err(|e| e.with_identity(&plan.identity));
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(a) => {
                counter!("apply_ok", 1u64);
                info!(object = %a.identity, created = a.created, changed = a.changed, took_ms = %t0.elapsed().as_millis(), "apply ok");
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(object = %plan.identity, error = %e, "apply failed");
            }
        }
        res
    }

    async fn apply_inner(&self, plan: &Plan, cancel: &CancellationToken) -> KeelResult<Applied> {
        let Some(target) = Self::target(&plan.resource, &plan.identity)? else {
            return self.create_generated(plan, cancel).await;
        };
        if plan.is_noop() {
            // nothing to write; refresh only
            if let Some(observed) = self.fetch(&target, cancel).await? {
                return Ok(Applied {
                    identity: plan.identity.clone(),
                    observed,
                    baseline: plan.patch.next_baseline.clone(),
                    created: false,
                    changed: false,
                });
            }
            warn!(object = %plan.identity, "object vanished since plan; recreating");
        }
        let created = self.write(plan, &target, false, cancel).await?.1;
        let observed = match self.fetch(&target, cancel).await? {
            Some(o) => o,
            None => return Err(Error::not_found(format!("{} disappeared right after apply", plan.identity))),
        };
        Ok(Applied {
            identity: plan.identity.clone(),
            observed,
            baseline: plan.patch.next_baseline.clone(),
            created,
            changed: true,
        })
    }

    /// Send the plan's write. Returns the server's object and whether it was
    /// created by this call.
    async fn write(
        &self,
        plan: &Plan,
        target: &ObjectRef,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> KeelResult<(DynamicValue, bool)> {
        let params = self.params(dry_run);
        match self.config.strategy {
            ApplyStrategy::ServerSide => {
                let mut body = plan.patch.apply_configuration();
                ensure_metadata(&mut body, &plan.identity);
                let out = cancellable(cancel, self.cluster.apply(target, &body, &params)).await?;
                Ok((out, !plan.exists()))
            }
            ApplyStrategy::MergePatch => {
                if plan.exists() {
                    self.guard_fresh(plan, target, cancel).await?;
                    let body = plan.patch.to_merge_patch();
                    match cancellable(cancel, self.cluster.merge_patch(target, &body, &params)).await {
                        Ok(out) => return Ok((out, false)),
                        Err(e) if e.is_not_found() => {
                            warn!(object = %plan.identity, "object deleted out of band; creating");
                        }
                        Err(e) => return Err(e),
                    }
                }
                let mut body = plan.patch.next_baseline.clone();
                ensure_metadata(&mut body, &plan.identity);
                let out = cancellable(
                    cancel,
                    self.cluster.create(&plan.resource, plan.identity.namespace.as_deref(), &body, &params),
                )
                .await?;
                Ok((out, true))
            }
        }
    }

    /// Merge patches are not ownership-aware: refuse to write over a change
    /// made after the plan was computed.
    async fn guard_fresh(&self, plan: &Plan, target: &ObjectRef, cancel: &CancellationToken) -> KeelResult<()> {
        let Some(planned_rv) = plan.observed.as_ref().and_then(|o| o.resource_version.as_deref()) else {
            return Ok(());
        };
        let Some(live) = self.fetch(target, cancel).await? else {
            return Ok(());
        };
        match live.resource_version.as_deref() {
            Some(cur) if !cur.is_empty() && cur != planned_rv => {
                counter!("apply_stale_blocked_total", 1u64);
                Err(Error::failed(format!(
                    "live object changed (rv {planned_rv} -> {cur}) since plan; re-plan and try again"
                )))
            }
            _ => Ok(()),
        }
    }

    async fn create_generated(&self, plan: &Plan, cancel: &CancellationToken) -> KeelResult<Applied> {
        let mut body = plan.patch.next_baseline.clone();
        ensure_metadata(&mut body, &plan.identity);
        let params = self.params(false);
        let out = cancellable(
            cancel,
            self.cluster.create(&plan.resource, plan.identity.namespace.as_deref(), &body, &params),
        )
        .await?;
        let name = out
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(DynamicValue::as_str)
            .ok_or_else(|| Error::failed("server returned no name for generated object"))?;
        let identity = plan.identity.resolve_name(name);
        info!(object = %identity, "generated name resolved");
        let target = ObjectRef::new(&plan.resource, identity.namespace.as_deref(), name)?;

        // claim the fields under apply so later omissions release them
        let mut baseline = plan.patch.next_baseline.clone();
        ensure_metadata(&mut baseline, &identity);
        if self.config.strategy == ApplyStrategy::ServerSide {
            cancellable(cancel, self.cluster.apply(&target, &baseline, &params)).await?;
        }
        let observed = match self.fetch(&target, cancel).await? {
            Some(o) => o,
            None => observe(out),
        };
        Ok(Applied { identity, observed, baseline, created: true, changed: true })
    }

    /// Submit the plan with server-side dry-run and return the object the
    /// server would store. Nothing is persisted.
    pub async fn dry_run(&self, plan: &Plan, cancel: &CancellationToken) -> KeelResult<DynamicValue> {
        let t0 = Instant::now();
        let res = match Self::target(&plan.resource, &plan.identity)? {
            Some(target) => self.write(plan, &target, true, cancel).await.map(|(o, _)| o),
            None => {
                let mut body = plan.patch.next_baseline.clone();
                ensure_metadata(&mut body, &plan.identity);
                cancellable(
                    cancel,
                    self.cluster.create(&plan.resource, plan.identity.namespace.as_deref(), &body, &self.params(true)),
                )
                .await
            }
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(obj) => {
                counter!("apply_dry_ok", 1u64);
                Ok(strip_noisy(obj))
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                Err(e.with_identity(&plan.identity))
            }
        }
    }

    /// Delete `target`. A missing object counts as deleted; returns whether
    /// it existed.
    pub async fn delete(&self, target: &ObjectRef, dry_run: bool, cancel: &CancellationToken) -> KeelResult<bool> {
        let identity = target.identity();
        info!(object = %identity, dry_run, "delete start");
        match cancellable(cancel, self.cluster.delete(target, dry_run)).await {
            Ok(existed) => {
                if !existed {
                    debug!(object = %identity, "already gone");
                }
                Ok(existed)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.with_identity(&identity)),
        }
    }
}

fn observe(raw: DynamicValue) -> ObservedState {
    let mut obs = ObservedState::from_object(raw);
    obs.value = strip_noisy(obs.value);
    obs
}
