//! Per-kind CRUD surface for hosts that work with typed objects instead of
//! manifests.

use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::{Metadata, Resource};
use keel_convert::untyped;
use keel_core::{DynamicValue, Error, ErrorKind, Gvk, HostValue, KeelResult, ObjectName, ResourceIdentity};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Engine, ManifestApi};

/// CRUD over one kind. `update` of a deleted object recreates it; `delete`
/// of a missing object is `NotFound`, use [`delete_idempotent`] when absence
/// counts as success.
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    type Spec: Send + Sync;

    async fn create(&self, spec: &Self::Spec, cancel: &CancellationToken) -> KeelResult<ResourceIdentity>;

    async fn read(&self, identity: &ResourceIdentity, cancel: &CancellationToken) -> KeelResult<Option<Self::Spec>>;

    async fn update(&self, identity: &ResourceIdentity, spec: &Self::Spec, cancel: &CancellationToken) -> KeelResult<()>;

    async fn delete(&self, identity: &ResourceIdentity, cancel: &CancellationToken) -> KeelResult<()>;
}

/// `Ok(false)` when the object was already gone.
pub async fn delete_idempotent<A>(adapter: &A, identity: &ResourceIdentity, cancel: &CancellationToken) -> KeelResult<bool>
where
    A: ResourceAdapter + ?Sized,
{
    match adapter.delete(identity, cancel).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => {
            debug!(object = %identity, "adapter: already deleted");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// [`ResourceAdapter`] for a `k8s-openapi` type, driven through the engine.
pub struct TypedAdapter<K> {
    engine: Engine,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for TypedAdapter<K> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), _kind: PhantomData }
    }
}

impl<K> TypedAdapter<K>
where
    K: Resource + Metadata<Ty = ObjectMeta> + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(engine: Engine) -> Self {
        Self { engine, _kind: PhantomData }
    }

    fn gvk() -> Gvk {
        Gvk::from_api_version(K::API_VERSION, K::KIND)
    }

    fn identity_of(spec: &K) -> KeelResult<ResourceIdentity> {
        let meta = spec.metadata();
        let name = match (&meta.name, &meta.generate_name) {
            (Some(n), _) if !n.is_empty() => ObjectName::Named(n.clone()),
            (_, Some(prefix)) if !prefix.is_empty() => ObjectName::Generated(prefix.clone()),
            _ => return Err(Error::invalid(format!("{} has neither metadata.name nor metadata.generateName", K::KIND))),
        };
        Ok(ResourceIdentity::new(&Self::gvk(), meta.namespace.as_deref(), name))
    }

    fn to_host(spec: &K) -> KeelResult<HostValue> {
        let json = serde_json::to_value(spec).map_err(|e| Error::invalid(format!("serialize {}: {e}", K::KIND)))?;
        Ok(untyped(&DynamicValue::from(json)))
    }

    fn check_kind(identity: &ResourceIdentity) -> KeelResult<()> {
        if identity.gvk() != Self::gvk() {
            return Err(Error::invalid(format!("adapter for {} cannot handle {}", Self::gvk(), identity.gvk())));
        }
        Ok(())
    }
}

#[async_trait]
impl<K> ResourceAdapter for TypedAdapter<K>
where
    K: Resource + Metadata<Ty = ObjectMeta> + Serialize + DeserializeOwned + Send + Sync,
{
    type Spec = K;

    async fn create(&self, spec: &K, cancel: &CancellationToken) -> KeelResult<ResourceIdentity> {
        let identity = Self::identity_of(spec)?;
        let plan = self.engine.plan(&Self::to_host(spec)?, None, cancel).await?;
        if plan.exists() {
            let kind = ErrorKind::Remote { code: 409, message: format!("{} already exists", plan.identity()) };
            return Err(Error::new(kind).with_identity(&identity));
        }
        let report = self.engine.apply(&plan, None, cancel).await?;
        Ok(report.state.identity)
    }

    async fn read(&self, identity: &ResourceIdentity, cancel: &CancellationToken) -> KeelResult<Option<K>> {
        Self::check_kind(identity)?;
        let Some(observed) = self.engine.get(identity, cancel).await? else {
            return Ok(None);
        };
        serde_json::from_value(observed.value.to_json())
            .map(Some)
            .map_err(|e| Error::invalid(format!("decode {}: {e}", K::KIND)).with_identity(identity))
    }

    async fn update(&self, identity: &ResourceIdentity, spec: &K, cancel: &CancellationToken) -> KeelResult<()> {
        Self::check_kind(identity)?;
        let name = identity.name().ok_or_else(|| Error::invalid("generated name is not resolved yet"))?;
        let mut host = Self::to_host(spec)?;
        // the identity wins over the metadata of the typed object
        if let HostValue::Object(attrs) | HostValue::Map(attrs) = &mut host {
            if let Some(HostValue::Object(meta) | HostValue::Map(meta)) = attrs.get_mut("metadata") {
                meta.remove("generateName");
                meta.insert("name".into(), HostValue::string(name));
                if let Some(ns) = &identity.namespace {
                    meta.insert("namespace".into(), HostValue::string(ns.clone()));
                }
            }
        }
        let plan = self.engine.plan(&host, None, cancel).await?;
        if !plan.exists() {
            debug!(object = %identity, "adapter: object gone; update recreates it");
        }
        self.engine.apply(&plan, None, cancel).await?;
        Ok(())
    }

    async fn delete(&self, identity: &ResourceIdentity, cancel: &CancellationToken) -> KeelResult<()> {
        Self::check_kind(identity)?;
        let report = ManifestApi::delete(&self.engine, identity, false, cancel).await?;
        if !report.existed {
            return Err(Error::not_found(identity.to_string()).with_identity(identity));
        }
        Ok(())
    }
}
