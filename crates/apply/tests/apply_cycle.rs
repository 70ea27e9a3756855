use std::sync::Arc;

use keel_apply::ApplyEngine;
use keel_core::{ApplyStrategy, DynamicValue, EngineConfig, ErrorKind, FieldPath, Gvk, ObjectName, ResourceIdentity};
use keel_kubehub::{Cluster, DiscoveredResource, MemoryCluster, ObjectRef, RawSchema, WriteParams};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn configmaps() -> DiscoveredResource {
    DiscoveredResource { group: "".into(), version: "v1".into(), kind: "ConfigMap".into(), plural: "configmaps".into(), namespaced: true }
}

fn id() -> ResourceIdentity {
    ResourceIdentity::named(&Gvk::new("", "v1", "ConfigMap"), Some("ns"), "cm")
}

fn target() -> ObjectRef {
    ObjectRef::new(&configmaps(), Some("ns"), "cm").unwrap()
}

fn desired(data: serde_json::Value) -> DynamicValue {
    DynamicValue::from(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "ns"}, "data": data}))
}

fn p(s: &str) -> FieldPath {
    FieldPath::parse(s).unwrap()
}

fn setup(strategy: ApplyStrategy) -> (Arc<MemoryCluster>, ApplyEngine) {
    let cluster = Arc::new(MemoryCluster::new().with_kind(configmaps(), RawSchema::Missing));
    let config = EngineConfig { strategy, ..EngineConfig::default() };
    let engine = ApplyEngine::new(cluster.clone(), Arc::new(config));
    (cluster, engine)
}

#[tokio::test]
async fn create_then_replan_is_a_noop() {
    let (_c, engine) = setup(ApplyStrategy::ServerSide);
    let cancel = CancellationToken::new();
    let d = desired(json!({"a": "1"}));

    let plan = engine.plan(&id(), &configmaps(), &d, None, &cancel).await.unwrap();
    assert!(!plan.exists());
    let applied = engine.apply(&plan, &cancel).await.unwrap();
    assert!(applied.created && applied.changed);
    assert_eq!(applied.baseline, d);
    assert!(applied.observed.ownership.owned_by(&p("data.a"), "keel"));
    assert!(applied.observed.value.get_path(&p("metadata.resourceVersion")).is_none());

    let again = engine.plan(&id(), &configmaps(), &d, Some(&applied.baseline), &cancel).await.unwrap();
    assert!(again.is_noop());
    let second = engine.apply(&again, &cancel).await.unwrap();
    assert!(!second.changed);
    assert_eq!(second.observed.resource_version, applied.observed.resource_version);
}

#[tokio::test]
async fn removed_field_is_released_by_omission() {
    let (c, engine) = setup(ApplyStrategy::ServerSide);
    let cancel = CancellationToken::new();
    let first = desired(json!({"a": "1", "b": "2"}));
    let plan = engine.plan(&id(), &configmaps(), &first, None, &cancel).await.unwrap();
    let applied = engine.apply(&plan, &cancel).await.unwrap();

    let second = desired(json!({"a": "1"}));
    let plan = engine.plan(&id(), &configmaps(), &second, Some(&applied.baseline), &cancel).await.unwrap();
    assert_eq!(plan.patch.deletions.iter().cloned().collect::<Vec<_>>(), vec![p("data.b")]);
    engine.apply(&plan, &cancel).await.unwrap();
    assert!(c.object(&target()).unwrap().get_path(&p("data.b")).is_none());
}

#[tokio::test]
async fn conflict_names_both_managers_and_keeps_remote_state() {
    let (c, engine) = setup(ApplyStrategy::ServerSide);
    let cancel = CancellationToken::new();
    let other = WriteParams { field_manager: "helm".into(), force: false, dry_run: false };
    c.apply(&target(), &desired(json!({"a": "1"})), &other).await.unwrap();

    let plan = engine.plan(&id(), &configmaps(), &desired(json!({"a": "2"})), None, &cancel).await.unwrap();
    let err = engine.apply(&plan, &cancel).await.unwrap_err();
    assert_eq!(err.identity.as_ref(), Some(&id()));
    match &err.kind {
        ErrorKind::Conflict { manager, conflicts } => {
            assert_eq!(manager, "keel");
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].path, p("data.a"));
            assert_eq!(conflicts[0].manager, "helm");
        }
        other => panic!("unexpected {other:?}"),
    }
    let msg = err.to_string();
    assert!(msg.contains("\"keel\"") && msg.contains("\"helm\"") && msg.contains(".data.a"), "{msg}");
    assert_eq!(c.object(&target()).unwrap().get_path(&p("data.a")), Some(&DynamicValue::from("1")));
}

#[tokio::test]
async fn force_claims_conflicting_fields() {
    let cluster = Arc::new(MemoryCluster::new().with_kind(configmaps(), RawSchema::Missing));
    let config = EngineConfig { force_conflicts: true, ..EngineConfig::default() };
    let engine = ApplyEngine::new(cluster.clone(), Arc::new(config));
    let cancel = CancellationToken::new();
    let other = WriteParams { field_manager: "helm".into(), force: false, dry_run: false };
    cluster.apply(&target(), &desired(json!({"a": "1"})), &other).await.unwrap();

    let plan = engine.plan(&id(), &configmaps(), &desired(json!({"a": "2"})), None, &cancel).await.unwrap();
    let applied = engine.apply(&plan, &cancel).await.unwrap();
    assert_eq!(applied.observed.ownership.managers_at(&p("data.a")).into_iter().collect::<Vec<_>>(), vec!["keel"]);
}

#[tokio::test]
async fn deleted_object_is_recreated_with_merge_patch() {
    let (c, engine) = setup(ApplyStrategy::MergePatch);
    let cancel = CancellationToken::new();
    let d = desired(json!({"a": "1"}));
    let plan = engine.plan(&id(), &configmaps(), &d, None, &cancel).await.unwrap();
    let applied = engine.apply(&plan, &cancel).await.unwrap();
    assert!(applied.created);

    let plan = engine.plan(&id(), &configmaps(), &desired(json!({"a": "2"})), Some(&applied.baseline), &cancel).await.unwrap();
    assert!(c.delete(&target(), false).await.unwrap());
    let again = engine.apply(&plan, &cancel).await.unwrap();
    assert!(again.created);
    assert_eq!(c.object(&target()).unwrap().get_path(&p("data.a")), Some(&DynamicValue::from("2")));
}

#[tokio::test]
async fn merge_patch_keeps_foreign_siblings_of_a_dropped_map() {
    let (c, engine) = setup(ApplyStrategy::MergePatch);
    let cancel = CancellationToken::new();
    let plan = engine.plan(&id(), &configmaps(), &desired(json!({"a": "1"})), None, &cancel).await.unwrap();
    let applied = engine.apply(&plan, &cancel).await.unwrap();
    c.update_as(&target(), "helm", |o| {
        o.set_path(&p("data.b"), "2".into());
    })
    .unwrap();

    let without_data =
        DynamicValue::from(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "ns"}}));
    let plan = engine.plan(&id(), &configmaps(), &without_data, Some(&applied.baseline), &cancel).await.unwrap();
    assert_eq!(plan.patch.deletions.iter().cloned().collect::<Vec<_>>(), vec![p("data.a")]);
    assert_eq!(plan.patch.to_merge_patch().get("data"), Some(&DynamicValue::from(json!({"a": null}))));
    engine.apply(&plan, &cancel).await.unwrap();

    let obj = c.object(&target()).unwrap();
    assert!(obj.get_path(&p("data.a")).is_none());
    assert_eq!(obj.get_path(&p("data.b")), Some(&DynamicValue::from("2")));
}

#[tokio::test]
async fn merge_patch_refuses_stale_plans() {
    let (c, engine) = setup(ApplyStrategy::MergePatch);
    let cancel = CancellationToken::new();
    let plan = engine.plan(&id(), &configmaps(), &desired(json!({"a": "1"})), None, &cancel).await.unwrap();
    let applied = engine.apply(&plan, &cancel).await.unwrap();

    let plan = engine.plan(&id(), &configmaps(), &desired(json!({"a": "2"})), Some(&applied.baseline), &cancel).await.unwrap();
    c.update_as(&target(), "kubectl", |o| {
        o.set_path(&p("data.other"), "x".into());
    })
    .unwrap();
    let err = engine.apply(&plan, &cancel).await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Failed { .. }), "{err}");
}

#[tokio::test]
async fn generated_names_are_resolved_on_create() {
    let (c, engine) = setup(ApplyStrategy::ServerSide);
    let cancel = CancellationToken::new();
    let gid = ResourceIdentity::new(&Gvk::new("", "v1", "ConfigMap"), Some("ns"), ObjectName::Generated("job-".into()));
    let d = DynamicValue::from(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"generateName": "job-"}, "data": {"a": "1"}}));
    let plan = engine.plan(&gid, &configmaps(), &d, None, &cancel).await.unwrap();
    let applied = engine.apply(&plan, &cancel).await.unwrap();
    let name = applied.identity.name().unwrap().to_string();
    assert!(name.starts_with("job-"));
    assert_eq!(applied.baseline.get_path(&p("metadata.name")).and_then(DynamicValue::as_str), Some(name.as_str()));
    let t = ObjectRef::new(&configmaps(), Some("ns"), &name).unwrap();
    assert!(c.object(&t).is_some());
    assert!(applied.observed.ownership.owned_by(&p("data.a"), "keel"));
}

#[tokio::test]
async fn dry_run_persists_nothing() {
    let (c, engine) = setup(ApplyStrategy::ServerSide);
    let cancel = CancellationToken::new();
    let plan = engine.plan(&id(), &configmaps(), &desired(json!({"a": "1"})), None, &cancel).await.unwrap();
    let would = engine.dry_run(&plan, &cancel).await.unwrap();
    assert_eq!(would.get_path(&p("data.a")), Some(&DynamicValue::from("1")));
    assert!(c.object(&target()).is_none());
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_c, engine) = setup(ApplyStrategy::ServerSide);
    let cancel = CancellationToken::new();
    let plan = engine.plan(&id(), &configmaps(), &desired(json!({"a": "1"})), None, &cancel).await.unwrap();
    engine.apply(&plan, &cancel).await.unwrap();
    assert!(engine.delete(&target(), false, &cancel).await.unwrap());
    assert!(!engine.delete(&target(), false, &cancel).await.unwrap());
}

#[tokio::test]
async fn cancelled_token_stops_before_writing() {
    let (c, engine) = setup(ApplyStrategy::ServerSide);
    let cancel = CancellationToken::new();
    let plan = engine.plan(&id(), &configmaps(), &desired(json!({"a": "1"})), None, &cancel).await.unwrap();
    cancel.cancel();
    let err = engine.apply(&plan, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(c.object(&target()).is_none());
}
