use std::sync::Arc;
use std::time::Duration;

use keel_api::{ConditionMatch, Engine, ManifestApi, ManifestState, WaitState};
use keel_core::{
    DynamicValue, EngineConfig, ErrorKind, FieldPath, Gvk, HostValue, ResourceIdentity, WaitConfig,
};
use keel_kubehub::{Cluster, DiscoveredResource, MemoryCluster, ObjectRef, RawSchema, WriteParams};
use keel_wait::WaitTarget;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn widgets() -> DiscoveredResource {
    DiscoveredResource {
        group: "example.com".into(),
        version: "v1".into(),
        kind: "Widget".into(),
        plural: "widgets".into(),
        namespaced: true,
    }
}

fn widget_schema() -> RawSchema {
    RawSchema::Crd(json!({
        "type": "object",
        "properties": {
            "spec": {
                "type": "object",
                "required": ["size"],
                "properties": {"size": {"type": "integer"}, "color": {"type": "string"}}
            }
        }
    }))
}

fn id() -> ResourceIdentity {
    ResourceIdentity::named(&Gvk::new("example.com", "v1", "Widget"), Some("ns"), "w")
}

fn target() -> ObjectRef {
    ObjectRef::new(&widgets(), Some("ns"), "w").unwrap()
}

fn p(s: &str) -> FieldPath {
    FieldPath::parse(s).unwrap()
}

fn manifest(metadata: HostValue, spec: HostValue) -> HostValue {
    HostValue::object([
        ("apiVersion", HostValue::string("example.com/v1")),
        ("kind", HostValue::string("Widget")),
        ("metadata", metadata),
        ("spec", spec),
    ])
}

fn widget(size: i64) -> HostValue {
    manifest(
        HostValue::object([("name", HostValue::string("w")), ("namespace", HostValue::string("ns"))]),
        HostValue::object([("size", HostValue::int(size))]),
    )
}

fn setup(config: EngineConfig) -> (Arc<MemoryCluster>, Engine) {
    let cluster = Arc::new(MemoryCluster::new().with_kind(widgets(), widget_schema()));
    let engine = Engine::new(cluster.clone(), config);
    (cluster, engine)
}

fn remote_size(c: &MemoryCluster) -> Option<i64> {
    c.object(&target()).and_then(|o| o.get_path(&p("spec.size")).and_then(DynamicValue::as_i64))
}

#[tokio::test]
async fn plan_apply_then_replan_is_a_noop() {
    let (c, engine) = setup(EngineConfig::default());
    let cancel = CancellationToken::new();

    let plan = engine.plan(&widget(1), None, &cancel).await.unwrap();
    assert_eq!(plan.identity(), &id());
    assert!(!plan.exists());
    assert!(plan.set_paths().contains(&p("spec.size")));

    let report = engine.apply(&plan, None, &cancel).await.unwrap();
    assert!(report.created && report.changed);
    assert!(report.wait.is_none());
    assert_eq!(report.state.baseline, widget(1));
    assert_eq!(remote_size(&c), Some(1));

    let again = engine.plan(&widget(1), Some(&report.state), &cancel).await.unwrap();
    assert!(again.is_noop());
    let second = engine.apply(&again, None, &cancel).await.unwrap();
    assert!(!second.changed);
    assert_eq!(second.state.baseline, report.state.baseline);
}

#[tokio::test]
async fn drift_on_a_field_another_manager_took_is_accepted() {
    let (c, engine) = setup(EngineConfig::default());
    let cancel = CancellationToken::new();
    let plan = engine.plan(&widget(1), None, &cancel).await.unwrap();
    let state = engine.apply(&plan, None, &cancel).await.unwrap().state;

    c.update_as(&target(), "kubectl", |o| {
        o.set_path(&p("spec.size"), DynamicValue::from(5i64));
    })
    .unwrap();

    let plan = engine.plan(&widget(1), Some(&state), &cancel).await.unwrap();
    assert_eq!(plan.drift().cloned().collect::<Vec<_>>(), vec![p("spec.size")]);
    assert!(plan.is_noop());
    let report = engine.apply(&plan, None, &cancel).await.unwrap();
    assert_eq!(report.state.baseline.attr("spec").and_then(|s| s.attr("size")), Some(&HostValue::int(5)));
    assert_eq!(remote_size(&c), Some(5));
}

#[tokio::test]
async fn second_manager_conflicts_and_leaves_the_object_alone() {
    let (c, engine) = setup(EngineConfig::default());
    let cancel = CancellationToken::new();
    let plan = engine.plan(&widget(1), None, &cancel).await.unwrap();
    engine.apply(&plan, None, &cancel).await.unwrap();

    let other = Engine::new(c.clone(), EngineConfig { field_manager: "ci".into(), ..EngineConfig::default() });
    let plan = other.plan(&widget(2), None, &cancel).await.unwrap();
    let err = other.apply(&plan, None, &cancel).await.unwrap_err();
    assert!(err.is_conflict(), "{err}");
    match &err.kind {
        ErrorKind::Conflict { manager, conflicts } => {
            assert_eq!(manager, "ci");
            assert!(conflicts.iter().any(|f| f.path == p("spec.size") && f.manager == "keel"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(remote_size(&c), Some(1));
}

#[tokio::test]
async fn deleted_object_is_recreated_on_the_next_apply() {
    let (c, engine) = setup(EngineConfig::default());
    let cancel = CancellationToken::new();
    let plan = engine.plan(&widget(1), None, &cancel).await.unwrap();
    let state = engine.apply(&plan, None, &cancel).await.unwrap().state;

    assert!(c.delete(&target(), false).await.unwrap());
    let plan = engine.plan(&widget(2), Some(&state), &cancel).await.unwrap();
    assert!(!plan.exists());
    let report = engine.apply(&plan, None, &cancel).await.unwrap();
    assert!(report.created);
    assert_eq!(remote_size(&c), Some(2));
}

#[tokio::test]
async fn read_of_a_vanished_object_is_not_found() {
    let (c, engine) = setup(EngineConfig::default());
    let cancel = CancellationToken::new();
    let plan = engine.plan(&widget(1), None, &cancel).await.unwrap();
    let state = engine.apply(&plan, None, &cancel).await.unwrap().state;

    let refreshed = engine.read(&state, &cancel).await.unwrap();
    assert_eq!(refreshed.baseline, state.baseline);
    assert!(refreshed.observed.is_some());

    c.delete(&target(), false).await.unwrap();
    let err = engine.read(&state, &cancel).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.identity, Some(id()));
}

#[tokio::test]
async fn delete_counts_a_missing_object_as_deleted() {
    let (_c, engine) = setup(EngineConfig::default());
    let cancel = CancellationToken::new();
    let report = engine.delete(&id(), true, &cancel).await.unwrap();
    assert!(!report.existed);
    assert!(report.wait.is_none());

    let plan = engine.plan(&widget(1), None, &cancel).await.unwrap();
    engine.apply(&plan, None, &cancel).await.unwrap();
    let report = engine.delete(&id(), true, &cancel).await.unwrap();
    assert!(report.existed);
    assert_eq!(report.wait.map(|w| w.state), Some(WaitState::Satisfied));
}

#[tokio::test]
async fn import_takes_only_the_fields_this_manager_owns() {
    let (c, engine) = setup(EngineConfig::default());
    let cancel = CancellationToken::new();
    let body = DynamicValue::from(json!({
        "apiVersion": "example.com/v1", "kind": "Widget",
        "metadata": {"name": "w", "namespace": "ns"},
        "spec": {"size": 3}
    }));
    let params = WriteParams { field_manager: "keel".into(), force: false, dry_run: false };
    c.apply(&target(), &body, &params).await.unwrap();
    c.update_as(&target(), "kubectl", |o| {
        o.set_path(&p("spec.color"), "red".into());
    })
    .unwrap();

    let state = engine.import(&id(), &cancel).await.unwrap();
    assert_eq!(state.baseline, widget(3));
    let observed = state.observed.as_ref().unwrap();
    assert_eq!(observed.attr("spec").and_then(|s| s.attr("color")), Some(&HostValue::string("red")));

    let plan = engine.plan(&widget(3), Some(&state), &cancel).await.unwrap();
    assert!(plan.is_noop());
}

#[tokio::test]
async fn import_of_a_missing_object_fails() {
    let (_c, engine) = setup(EngineConfig::default());
    let err = engine.import(&id(), &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn generated_name_is_pinned_after_the_first_create() {
    let (c, engine) = setup(EngineConfig::default());
    let cancel = CancellationToken::new();
    let desired = manifest(
        HostValue::object([("generateName", HostValue::string("w-")), ("namespace", HostValue::string("ns"))]),
        HostValue::object([("size", HostValue::int(1))]),
    );

    let plan = engine.plan(&desired, None, &cancel).await.unwrap();
    assert!(plan.identity().is_generated());
    let state = engine.apply(&plan, None, &cancel).await.unwrap().state;
    let name = state.identity.name().unwrap().to_string();
    assert!(name.starts_with("w-"), "{name}");

    let again = engine.plan(&desired, Some(&state), &cancel).await.unwrap();
    assert_eq!(again.identity(), &state.identity);
    assert!(again.is_noop());
    let t = ObjectRef::new(&widgets(), Some("ns"), &name).unwrap();
    assert!(c.object(&t).is_some());
}

#[tokio::test]
async fn namespace_defaults_for_namespaced_kinds() {
    let (_c, engine) = setup(EngineConfig::default());
    let desired = manifest(
        HostValue::object([("name", HostValue::string("w"))]),
        HostValue::object([("size", HostValue::int(1))]),
    );
    let plan = engine.plan(&desired, None, &CancellationToken::new()).await.unwrap();
    assert_eq!(plan.identity().namespace.as_deref(), Some("default"));
}

#[tokio::test]
async fn schema_violations_carry_the_path() {
    let (_c, engine) = setup(EngineConfig::default());
    let cancel = CancellationToken::new();

    let wrong = manifest(
        HostValue::object([("name", HostValue::string("w")), ("namespace", HostValue::string("ns"))]),
        HostValue::object([("size", HostValue::string("big"))]),
    );
    let err = engine.plan(&wrong, None, &cancel).await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::TypeMismatch { .. }), "{err}");
    assert_eq!(err.path(), Some(&p("spec.size")));

    let incomplete = manifest(
        HostValue::object([("name", HostValue::string("w")), ("namespace", HostValue::string("ns"))]),
        HostValue::object([("color", HostValue::string("red"))]),
    );
    let err = engine.plan(&incomplete, None, &cancel).await.unwrap_err();
    assert_eq!(err.path(), Some(&p("spec.size")));
    assert_eq!(err.identity, Some(id()));
}

#[tokio::test]
async fn unknown_kind_is_reported_as_such() {
    let (_c, engine) = setup(EngineConfig::default());
    let err = engine.schema("example.com/v1/Gadget", &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::UnknownKind { .. }), "{err}");
    let ok = engine.schema("example.com/v1/Widget", &CancellationToken::new()).await.unwrap();
    assert_eq!(ok.resource.plural, "widgets");

    let cancel = CancellationToken::new();
    let gadget = ResourceIdentity::named(&Gvk::new("example.com", "v1", "Gadget"), Some("ns"), "g");
    let state = ManifestState { identity: gadget.clone(), baseline: HostValue::object([("spec", HostValue::Absent)]), observed: None };
    let errors = [
        engine.read(&state, &cancel).await.unwrap_err(),
        engine.delete(&gadget, false, &cancel).await.unwrap_err(),
        engine.import(&gadget, &cancel).await.unwrap_err(),
    ];
    for err in errors {
        assert!(matches!(err.kind, ErrorKind::UnknownKind { .. }), "{err}");
        assert_eq!(err.identity.as_ref(), Some(&gadget));
    }
}

#[tokio::test]
async fn dry_run_shows_the_result_without_writing() {
    let (c, engine) = setup(EngineConfig::default());
    let cancel = CancellationToken::new();
    let plan = engine.plan(&widget(4), None, &cancel).await.unwrap();
    let would = engine.dry_run(&plan, &cancel).await.unwrap();
    assert_eq!(would.attr("spec").and_then(|s| s.attr("size")), Some(&HostValue::int(4)));
    assert!(c.object(&target()).is_none());
}

fn fast_wait() -> EngineConfig {
    EngineConfig {
        wait: WaitConfig { base_ms: 100, max_ms: 100, timeout_secs: 2, max_fetch_errors: 3 },
        ..EngineConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn apply_waits_until_ready() {
    let (c, engine) = setup(fast_wait());
    let cancel = CancellationToken::new();
    let ready = c.clone();
    let plan = engine.plan(&widget(1), None, &cancel).await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(350)).await;
        ready
            .update_as(&target(), "widget-controller", |o| {
                o.set_path(&p("status"), DynamicValue::from(json!({"conditions": [{"type": "Ready", "status": "True"}]})));
            })
            .unwrap();
    });
    let until = WaitTarget::ready(ConditionMatch::new("Ready", "True"));
    let report = engine.apply(&plan, Some(&until), &cancel).await.unwrap();
    let wait = report.wait.unwrap();
    assert_eq!(wait.state, WaitState::Satisfied);
    assert_eq!(wait.polls, 5);
}

#[tokio::test(start_paused = true)]
async fn failed_wait_keeps_the_applied_state() {
    let (c, engine) = setup(fast_wait());
    let cancel = CancellationToken::new();
    let plan = engine.plan(&widget(1), None, &cancel).await.unwrap();
    let until = WaitTarget::ready(ConditionMatch::new("Ready", "True"));
    let report = engine.apply(&plan, Some(&until), &cancel).await.unwrap();
    assert_eq!(report.wait.as_ref().map(|w| w.state), Some(WaitState::TimedOut));
    assert_eq!(report.state.baseline, widget(1));
    assert!(report.wait.unwrap().into_result().is_err());
    assert_eq!(remote_size(&c), Some(1));
}
