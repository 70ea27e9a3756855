use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_api::{delete_idempotent, Engine, ResourceAdapter, TypedAdapter};
use keel_core::{EngineConfig, ErrorKind, Gvk, ResourceIdentity};
use keel_kubehub::{DiscoveredResource, MemoryCluster, RawSchema};
use tokio_util::sync::CancellationToken;

fn configmaps() -> DiscoveredResource {
    DiscoveredResource { group: "".into(), version: "v1".into(), kind: "ConfigMap".into(), plural: "configmaps".into(), namespaced: true }
}

fn config_map(data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta { name: Some("settings".into()), namespace: Some("apps".into()), ..ObjectMeta::default() },
        data: Some(data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>()),
        ..ConfigMap::default()
    }
}

fn adapter() -> TypedAdapter<ConfigMap> {
    let cluster = Arc::new(MemoryCluster::new().with_kind(configmaps(), RawSchema::Missing));
    TypedAdapter::new(Engine::new(cluster, EngineConfig::default()))
}

#[tokio::test]
async fn create_read_update_delete() {
    let cms = adapter();
    let cancel = CancellationToken::new();

    let id = cms.create(&config_map(&[("a", "1")]), &cancel).await.unwrap();
    assert_eq!(id, ResourceIdentity::named(&Gvk::new("", "v1", "ConfigMap"), Some("apps"), "settings"));

    let read = cms.read(&id, &cancel).await.unwrap().unwrap();
    assert_eq!(read.data.unwrap().get("a").map(String::as_str), Some("1"));
    assert!(read.metadata.uid.is_some());

    cms.update(&id, &config_map(&[("b", "2")]), &cancel).await.unwrap();
    let data = cms.read(&id, &cancel).await.unwrap().unwrap().data.unwrap();
    assert_eq!(data.get("b").map(String::as_str), Some("2"));
    assert!(!data.contains_key("a"), "released field should be gone: {data:?}");

    cms.delete(&id, &cancel).await.unwrap();
    assert!(cms.read(&id, &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn create_of_an_existing_object_is_refused() {
    let cms = adapter();
    let cancel = CancellationToken::new();
    cms.create(&config_map(&[("a", "1")]), &cancel).await.unwrap();
    let err = cms.create(&config_map(&[("a", "2")]), &cancel).await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Remote { code: 409, .. }), "{err}");
}

#[tokio::test]
async fn missing_objects_are_recreated_on_update_and_tolerated_on_delete() {
    let cms = adapter();
    let cancel = CancellationToken::new();
    let id = ResourceIdentity::named(&Gvk::new("", "v1", "ConfigMap"), Some("apps"), "settings");

    assert!(cms.delete(&id, &cancel).await.unwrap_err().is_not_found());
    assert!(!delete_idempotent(&cms, &id, &cancel).await.unwrap());

    cms.update(&id, &config_map(&[("a", "1")]), &cancel).await.unwrap();
    assert!(cms.read(&id, &cancel).await.unwrap().is_some());
    assert!(delete_idempotent(&cms, &id, &cancel).await.unwrap());
}

#[tokio::test]
async fn other_kinds_are_rejected() {
    let cms = adapter();
    let secret = ResourceIdentity::named(&Gvk::new("", "v1", "Secret"), Some("apps"), "settings");
    let err = cms.read(&secret, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Invalid { .. }));
}
