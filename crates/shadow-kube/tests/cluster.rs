//! Integration tests for shadow-kube.
//!
//! These tests require:
//! - A reachable Kubernetes cluster in the current kubeconfig context
//! - Permission to create, patch and delete pods in `SHADOW_NAMESPACE`
//! - A long-running image with `sh` (default `nginx:1.27-alpine`, override with `SHADOW_TEST_IMAGE`)
//!
//! Run with: `cargo test -p shadow-kube -- --ignored`

use shadow_core::{
    CoreError, DesiredInstanceSpec, ExecBridge, ExecConfig, LabelSelector, LifecyclePoller,
    PodStore, PollConfig, ReconnectPolicy, ReleaseOutcome, ResourceMeta, ResourceWatcher,
    ShadowConfig, SharedInstances, WatchEvent, WatchTarget, COMPONENT_LABEL, COMPONENT_SHADOW,
};
use shadow_kube::{KubePodStore, SHADOW_CONTAINER};
use std::sync::Arc;
use std::time::Duration;

const START_TIMEOUT: Duration = Duration::from_secs(120);

fn test_image() -> String {
    std::env::var("SHADOW_TEST_IMAGE").unwrap_or_else(|_| "nginx:1.27-alpine".to_string())
}

fn server() -> DesiredInstanceSpec {
    DesiredInstanceSpec::new(test_image()).env("SHADOW_TEST", "1")
}

fn fast_polls() -> PollConfig {
    PollConfig {
        interval: Duration::from_secs(2),
        // Covers the default 30s termination grace period
        terminate_attempts: 30,
    }
}

async fn connect() -> (Arc<KubePodStore>, String) {
    let store = KubePodStore::try_default()
        .await
        .expect("Failed to connect to cluster");
    (Arc::new(store), ShadowConfig::from_env().namespace)
}

/// Acquire twice, release twice: one pod, deleted on the last release.
#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn test_shared_pod_lifecycle() {
    let (store, ns) = connect().await;
    let shared = SharedInstances::new(store.clone(), fast_polls(), Default::default());
    let meta = ResourceMeta::generated("shadow-it", &ns);
    let name = meta.name.clone();

    let spec = server();
    let first = shared
        .acquire(meta.clone(), spec.clone(), START_TIMEOUT)
        .await
        .expect("Failed to acquire pod");
    assert_eq!(first.ref_count(), Some("1"));

    let second = shared
        .acquire(meta, spec, START_TIMEOUT)
        .await
        .expect("Failed to share pod");
    assert_eq!(second.ref_count(), Some("2"));

    assert_eq!(
        shared.release(&name, &ns).await.expect("Failed to release"),
        ReleaseOutcome::StillShared
    );
    assert!(matches!(
        shared.release(&name, &ns).await.expect("Failed to release"),
        ReleaseOutcome::Removed(_)
    ));
    assert!(store.get(&name, &ns).await.unwrap_err().is_not_found());
}

/// Set-ready on a selector nothing matches names the selector.
#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn test_set_ready_without_pods() {
    let (store, ns) = connect().await;
    let poller = LifecyclePoller::new(store, fast_polls());
    let selector = LabelSelector::new().with("shadow.io/test", "no-such-pod");

    let err = poller
        .wait_until_set_ready(&selector, &ns, Duration::from_secs(4), 1)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::NotFound(ref s) if s.contains("no-such-pod")));
}

/// Exec output is captured and a failing command surfaces as RemoteCommand.
#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn test_exec_roundtrip() {
    let (store, ns) = connect().await;
    let meta = ResourceMeta::generated("shadow-exec", &ns)
        .with_label(COMPONENT_LABEL, COMPONENT_SHADOW);
    let name = meta.name.clone();
    store.create(meta, server()).await.expect("Failed to create pod");

    let poller = LifecyclePoller::new(store.clone(), fast_polls());
    if let Err(e) = poller.wait_until_running(&name, &ns, START_TIMEOUT).await {
        let _ = store.delete(&name, &ns).await;
        panic!("pod did not start: {e}");
    }

    let bridge = ExecBridge::new(store.clone(), ExecConfig::default());
    let out = bridge
        .exec(SHADOW_CONTAINER, &name, &ns, ["sh", "-c", "printf '  hi  '"])
        .await
        .expect("Failed to exec");
    assert_eq!(out.stdout, "hi");

    let err = bridge
        .exec(SHADOW_CONTAINER, &name, &ns, ["sh", "-c", "echo \"error: 'boom'\" >&2"])
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");

    store.delete(&name, &ns).await.expect("Failed to delete pod");
}

/// A watch sees the pod being added and deleted.
#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn test_watch_by_name() {
    let (store, ns) = connect().await;
    let meta = ResourceMeta::generated("shadow-watch", &ns);
    let name = meta.name.clone();

    let watcher = ResourceWatcher::new(store.clone(), ReconnectPolicy::FailClosed);
    let mut events = watcher.subscribe(WatchTarget::Name(name.clone()), &ns);
    tokio::time::sleep(Duration::from_secs(1)).await;

    store.create(meta, server()).await.expect("Failed to create pod");
    store.delete(&name, &ns).await.expect("Failed to delete pod");

    let mut saw_added = false;
    let deadline = tokio::time::sleep(START_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => panic!("no delete event for {name}"),
            event = events.next() => match event {
                Some(WatchEvent::Added(_)) => saw_added = true,
                Some(WatchEvent::Deleted(_)) => break,
                Some(WatchEvent::Modified(_)) => {}
                None => panic!("watch closed early"),
            },
        }
    }
    assert!(saw_added);
    events.shutdown().await.expect("watch failed");
}
