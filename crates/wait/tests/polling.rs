use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_core::{DynamicValue, WaitConfig};
use keel_kubehub::{Cluster, DiscoveredResource, MemoryCluster, ObjectRef, WriteParams};
use keel_wait::{ConditionMatch, WaitController, WaitState, WaitTarget};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn pods() -> DiscoveredResource {
    DiscoveredResource { group: "".into(), version: "v1".into(), kind: "Pod".into(), plural: "pods".into(), namespaced: true }
}

fn target() -> ObjectRef {
    ObjectRef::new(&pods(), Some("ns"), "p").unwrap()
}

fn constant(interval_ms: u64, timeout_secs: u64) -> WaitConfig {
    WaitConfig { base_ms: interval_ms, max_ms: interval_ms, timeout_secs, max_fetch_errors: 3 }
}

async fn seeded() -> Arc<MemoryCluster> {
    let c = Arc::new(MemoryCluster::new());
    let body = DynamicValue::from(json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": "p", "namespace": "ns"},
        "spec": {"containers": [{"name": "c", "image": "nginx"}]}
    }));
    let params = WriteParams { field_manager: "keel".into(), force: false, dry_run: false };
    c.apply(&target(), &body, &params).await.unwrap();
    c
}

fn counting_never(counter: Arc<AtomicU32>) -> WaitTarget {
    WaitTarget::ready(move |_: &DynamicValue| {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    })
}

#[tokio::test(start_paused = true)]
async fn times_out_right_after_the_nth_poll() {
    let c = seeded().await;
    let ctl = WaitController::new(c, constant(1000, 5));
    let evaluations = Arc::new(AtomicU32::new(0));
    let out = ctl.wait(&target(), &counting_never(evaluations.clone()), &CancellationToken::new()).await;
    assert_eq!(out.state, WaitState::TimedOut);
    assert_eq!(out.polls, 5);
    assert_eq!(evaluations.load(Ordering::SeqCst), 5);
    assert_eq!(out.elapsed_ms, 4000);
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_cannot_outlive_the_deadline() {
    let c = seeded().await;
    c.set_get_delay(Some(Duration::from_secs(60)));
    let ctl = WaitController::new(c, constant(1000, 5));
    let always = WaitTarget::ready(|_: &DynamicValue| true);
    let out = ctl.wait(&target(), &always, &CancellationToken::new()).await;
    assert_eq!(out.state, WaitState::TimedOut);
    assert_eq!(out.polls, 1);
    assert_eq!(out.elapsed_ms, 5000);
}

#[tokio::test(start_paused = true)]
async fn satisfied_once_the_condition_appears() {
    let c = seeded().await;
    let ctl = WaitController::new(c.clone(), WaitConfig { base_ms: 100, max_ms: 400, timeout_secs: 60, max_fetch_errors: 3 });
    let flip = c.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(650)).await;
        flip.update_as(&target(), "kubelet", |o| {
            o.set_path(
                &keel_core::FieldPath::parse("status").unwrap(),
                DynamicValue::from(json!({"conditions": [{"type": "Ready", "status": "True"}]})),
            );
        })
        .unwrap();
    });
    let what = WaitTarget::ready(ConditionMatch::new("Ready", "True"));
    let out = ctl.wait(&target(), &what, &CancellationToken::new()).await;
    assert_eq!(out.state, WaitState::Satisfied);
    // polls at 0, 100, 300, 700
    assert_eq!(out.polls, 4);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_wait_is_cancelled_not_timed_out() {
    let c = seeded().await;
    let ctl = WaitController::new(c, constant(1000, 5));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.cancel();
    });
    let out = ctl.wait(&target(), &counting_never(Arc::new(AtomicU32::new(0))), &cancel).await;
    assert_eq!(out.state, WaitState::Cancelled);
    assert_eq!(out.polls, 3);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_fetch() {
    let c = seeded().await;
    c.set_get_delay(Some(Duration::from_secs(30)));
    let ctl = WaitController::new(c, constant(1000, 5));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });
    let out = ctl.wait(&target(), &counting_never(Arc::new(AtomicU32::new(0))), &cancel).await;
    assert_eq!(out.state, WaitState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn transient_fetch_errors_are_tolerated() {
    let c = seeded().await;
    c.fail_gets(3);
    let ctl = WaitController::new(c, constant(100, 5));
    let out = ctl.wait(&target(), &WaitTarget::ready(|_: &DynamicValue| true), &CancellationToken::new()).await;
    assert_eq!(out.state, WaitState::Satisfied);
    assert_eq!(out.polls, 4);
}

#[tokio::test(start_paused = true)]
async fn persistent_fetch_errors_fail() {
    let c = seeded().await;
    c.fail_gets(100);
    let ctl = WaitController::new(c, constant(100, 5));
    let out = ctl.wait(&target(), &WaitTarget::ready(|_: &DynamicValue| true), &CancellationToken::new()).await;
    assert_eq!(out.state, WaitState::Failed);
    assert_eq!(out.polls, 4);
    assert!(out.reason.unwrap().contains("4 times"));
}

#[tokio::test(start_paused = true)]
async fn predicate_error_fails_without_retry() {
    let c = seeded().await;
    let ctl = WaitController::new(c, constant(100, 5));
    let out = ctl.wait(&target(), &WaitTarget::ready(keel_wait::Rollout), &CancellationToken::new()).await;
    assert_eq!(out.state, WaitState::Failed);
    assert_eq!(out.polls, 1);
}

#[tokio::test(start_paused = true)]
async fn object_deleted_while_waiting_for_readiness_fails() {
    let c = seeded().await;
    let ctl = WaitController::new(c.clone(), constant(100, 5));
    let gone = c.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        gone.delete(&target(), false).await.unwrap();
    });
    let out = ctl.wait(&target(), &counting_never(Arc::new(AtomicU32::new(0))), &CancellationToken::new()).await;
    assert_eq!(out.state, WaitState::Failed);
    assert_eq!(out.polls, 3);
}

#[tokio::test(start_paused = true)]
async fn deletion_wait_is_satisfied_when_gone() {
    let c = seeded().await;
    let ctl = WaitController::new(c.clone(), constant(100, 5));
    let gone = c.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        gone.delete(&target(), false).await.unwrap();
    });
    let out = ctl.wait(&target(), &WaitTarget::Deleted, &CancellationToken::new()).await;
    assert_eq!(out.state, WaitState::Satisfied);
    assert_eq!(out.polls, 4);
}
