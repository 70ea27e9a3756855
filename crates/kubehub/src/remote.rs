//! kube-rs backed [`Cluster`].

use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use keel_core::{DynamicValue, Error, ErrorKind, Gvk, KeelResult};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use tracing::{debug, info};

use crate::{status_error, Cluster, DiscoveredResource, ObjectRef, RawSchema, WriteParams};

/// Client built from the ambient kubeconfig or in-cluster config.
pub async fn get_kube_client() -> KeelResult<Client> {
    Client::try_default()
        .await
        .map_err(|e| Error::new(ErrorKind::Remote { code: 0, message: format!("building kube client: {e}") }))
}

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> KeelResult<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    fn api(&self, resource: &DiscoveredResource, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: resource.group.clone(),
            version: resource.version.clone(),
            api_version: resource.api_version(),
            kind: resource.kind.clone(),
            plural: resource.plural.clone(),
        };
        match (resource.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn target_api(&self, target: &ObjectRef) -> Api<DynamicObject> {
        self.api(&target.resource, target.namespace.as_deref())
    }

    async fn fetch_openapi_v3(&self, gvk: &Gvk) -> KeelResult<Option<serde_json::Value>> {
        let path = if gvk.group.is_empty() {
            format!("/openapi/v3/api/{}", gvk.version)
        } else {
            format!("/openapi/v3/apis/{}/{}", gvk.group, gvk.version)
        };
        let req = http::Request::get(&path)
            .header("Accept", "application/json")
            .body(Vec::new())
            .map_err(|e| Error::invalid(format!("building request for {path}: {e}")))?;
        match self.client.request_text(req).await {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| discovery_unavailable(gvk, format!("decoding {path}: {e}"))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(discovery_unavailable(gvk, format!("GET {path}: {e}"))),
        }
    }

    /// `openAPIV3Schema` of the CRD serving `gvk`. Prefers the requested
    /// version, then the storage version, then the first served one.
    async fn fetch_crd_schema(&self, gvk: &Gvk) -> KeelResult<Option<serde_json::Value>> {
        if gvk.group.is_empty() {
            // builtins have no CRD
            return Ok(None);
        }
        let api: Api<apiextv1::CustomResourceDefinition> = Api::all(self.client.clone());
        let crds = api
            .list(&ListParams::default())
            .await
            .map_err(|e| discovery_unavailable(gvk, format!("listing CustomResourceDefinitions: {e}")))?;
        let Some(crd) = crds.into_iter().find(|c| c.spec.group == gvk.group && c.spec.names.kind == gvk.kind) else {
            return Ok(None);
        };
        let versions = &crd.spec.versions;
        let chosen = versions
            .iter()
            .find(|v| v.name == gvk.version)
            .or_else(|| versions.iter().find(|v| v.storage))
            .or_else(|| versions.iter().find(|v| v.served));
        let schema = chosen
            .and_then(|v| v.schema.as_ref())
            .and_then(|s| s.open_api_v3_schema.as_ref())
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| discovery_unavailable(gvk, format!("encoding CRD schema: {e}")))?;
        Ok(schema)
    }
}

fn discovery_unavailable(gvk: &Gvk, message: String) -> Error {
    ErrorKind::DiscoveryUnavailable { gvk: gvk.key(), message }.into()
}

fn to_value<T: serde::Serialize>(obj: &T) -> KeelResult<DynamicValue> {
    serde_json::to_value(obj)
        .map(DynamicValue::from)
        .map_err(|e| Error::invalid(format!("serializing object: {e}")))
}

fn write_error(err: kube::Error, target: &str, manager: &str) -> Error {
    match err {
        kube::Error::Api(ae) => status_error(ae.code, &ae.reason, &ae.message, target, manager),
        other => ErrorKind::Remote { code: 0, message: other.to_string() }.into(),
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn discover(&self, gvk: &Gvk) -> KeelResult<DiscoveredResource> {
        let t0 = Instant::now();
        let kgvk = GroupVersionKind { group: gvk.group.clone(), version: gvk.version.clone(), kind: gvk.kind.clone() };
        match discovery::pinned_kind(&self.client, &kgvk).await {
            Ok((ar, caps)) => {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                info!(gvk = %gvk, plural = %ar.plural, namespaced, took_ms = %t0.elapsed().as_millis(), "kind discovered");
                Ok(DiscoveredResource { group: ar.group, version: ar.version, kind: ar.kind, plural: ar.plural, namespaced })
            }
            Err(kube::Error::Discovery(e)) => {
                debug!(gvk = %gvk, error = %e, "kind not served");
                Err(ErrorKind::UnknownKind { gvk: gvk.key() }.into())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(ErrorKind::UnknownKind { gvk: gvk.key() }.into()),
            Err(e) => Err(discovery_unavailable(gvk, e.to_string())),
        }
    }

    async fn fetch_schema(&self, resource: &DiscoveredResource) -> KeelResult<RawSchema> {
        let gvk = resource.gvk();
        if let Some(doc) = self.fetch_openapi_v3(&gvk).await? {
            return Ok(RawSchema::OpenApiV3(doc));
        }
        debug!(gvk = %gvk, "no OpenAPI v3 document; trying CRD listing");
        Ok(match self.fetch_crd_schema(&gvk).await? {
            Some(schema) => RawSchema::Crd(schema),
            None => RawSchema::Missing,
        })
    }

    async fn get(&self, target: &ObjectRef) -> KeelResult<Option<DynamicValue>> {
        let api = self.target_api(target);
        match api.get_opt(&target.name).await {
            Ok(Some(obj)) => to_value(&obj).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(write_error(e, &target.identity().to_string(), "")),
        }
    }

    async fn apply(&self, target: &ObjectRef, body: &DynamicValue, params: &WriteParams) -> KeelResult<DynamicValue> {
        let api = self.target_api(target);
        let mut pp = PatchParams::apply(&params.field_manager);
        if params.force {
            pp = pp.force();
        }
        if params.dry_run {
            pp = pp.dry_run();
        }
        let json = body.to_json();
        let obj = api
            .patch(&target.name, &pp, &Patch::Apply(&json))
            .await
            .map_err(|e| write_error(e, &target.identity().to_string(), &params.field_manager))?;
        to_value(&obj)
    }

    async fn merge_patch(&self, target: &ObjectRef, patch: &DynamicValue, params: &WriteParams) -> KeelResult<DynamicValue> {
        let api = self.target_api(target);
        let pp = PatchParams {
            field_manager: Some(params.field_manager.clone()),
            dry_run: params.dry_run,
            ..PatchParams::default()
        };
        let json = patch.to_json();
        let obj = api
            .patch(&target.name, &pp, &Patch::Merge(&json))
            .await
            .map_err(|e| write_error(e, &target.identity().to_string(), &params.field_manager))?;
        to_value(&obj)
    }

    async fn create(
        &self,
        resource: &DiscoveredResource,
        namespace: Option<&str>,
        body: &DynamicValue,
        params: &WriteParams,
    ) -> KeelResult<DynamicValue> {
        let api = self.api(resource, namespace);
        let obj: DynamicObject = serde_json::from_value(body.to_json())
            .map_err(|e| Error::invalid(format!("object is not a valid {}: {e}", resource.kind)))?;
        let pp = PostParams { dry_run: params.dry_run, field_manager: Some(params.field_manager.clone()) };
        let created = api
            .create(&pp, &obj)
            .await
            .map_err(|e| write_error(e, &resource.gvk_key(), &params.field_manager))?;
        to_value(&created)
    }

    async fn delete(&self, target: &ObjectRef, dry_run: bool) -> KeelResult<bool> {
        let api = self.target_api(target);
        let dp = DeleteParams { dry_run, ..DeleteParams::default() };
        match api.delete(&target.name, &dp).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(write_error(e, &target.identity().to_string(), "")),
        }
    }
}
