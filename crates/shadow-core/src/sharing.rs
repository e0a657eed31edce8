//! Sharing one shadow pod between several logical clients.
//!
//! The first client to [`acquire`](SharedInstances::acquire) a name creates
//! the pod with a ref count of 1; later clients bump the count. Each
//! [`release`](SharedInstances::release) drops one reference and the last
//! one deletes the pod and waits for it to go away.

use crate::error::Result;
use crate::instance::{
    DesiredInstanceSpec, ResourceMeta, RuntimeInstance, COMPONENT_LABEL, COMPONENT_SHADOW,
    HEARTBEAT_ANNOTATION, REF_COUNT_ANNOTATION,
};
use crate::poller::{LifecyclePoller, PollConfig, TerminateOutcome};
use crate::refcount::{ConflictRetryPolicy, RefCountManager};
use crate::store::PodStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What [`SharedInstances::release`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other clients still reference the pod.
    StillShared,
    /// This was the last reference; the pod was deleted.
    Removed(TerminateOutcome),
}

/// Create-or-share and release-or-delete for shadow pods.
pub struct SharedInstances {
    store: Arc<dyn PodStore>,
    poller: LifecyclePoller,
    refs: RefCountManager,
}

impl SharedInstances {
    /// Create over the given store.
    pub fn new(store: Arc<dyn PodStore>, poll: PollConfig, retry: ConflictRetryPolicy) -> Self {
        Self {
            poller: LifecyclePoller::new(Arc::clone(&store), poll),
            refs: RefCountManager::new(Arc::clone(&store), retry),
            store,
        }
    }

    /// Abort waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.poller = self.poller.with_cancellation(token);
        self
    }

    /// Get a Running shadow pod named `meta.name`, creating it from `spec` if needed.
    ///
    /// An existing pod gains a reference. A pod still terminating from an
    /// earlier release is waited out first, then recreated.
    pub async fn acquire(
        &self,
        meta: ResourceMeta,
        spec: DesiredInstanceSpec,
        timeout: Duration,
    ) -> Result<RuntimeInstance> {
        let name = meta.name.clone();
        let namespace = meta.namespace.clone();

        match self.store.get(&name, &namespace).await {
            Ok(existing) if !existing.is_terminating() => {
                return self.share(&name, &namespace, timeout).await;
            }
            Ok(_) => {
                tracing::info!(pod = %name, "Shadow pod is terminating, waiting before recreating");
                if let TerminateOutcome::StillPresent(_) =
                    self.poller.wait_until_terminated(&name, &namespace).await?
                {
                    return self.share(&name, &namespace, timeout).await;
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut meta = meta;
        meta.labels
            .insert(COMPONENT_LABEL.to_string(), COMPONENT_SHADOW.to_string());
        meta.annotations
            .insert(REF_COUNT_ANNOTATION.to_string(), "1".to_string());
        meta.annotations.insert(
            HEARTBEAT_ANNOTATION.to_string(),
            Utc::now().timestamp().to_string(),
        );

        tracing::info!(pod = %name, image = %spec.image, leaf = spec.is_leaf, "Creating shadow pod");
        match self.store.create(meta, spec).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                tracing::info!(pod = %name, "Shadow pod created concurrently, sharing it");
                return self.share(&name, &namespace, timeout).await;
            }
            Err(e) => return Err(e),
        }
        self.poller
            .wait_until_running(&name, &namespace, timeout)
            .await
    }

    /// Drop one reference, deleting the pod when it was the last.
    pub async fn release(&self, name: &str, namespace: &str) -> Result<ReleaseOutcome> {
        if !self.refs.decrement(name, namespace).await? {
            return Ok(ReleaseOutcome::StillShared);
        }

        tracing::info!(pod = %name, "Removing shadow pod");
        match self.store.delete(name, namespace).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(pod = %name, "Shadow pod already gone");
                return Ok(ReleaseOutcome::Removed(TerminateOutcome::Terminated));
            }
            Err(e) => return Err(e),
        }
        let outcome = self.poller.wait_until_terminated(name, namespace).await?;
        Ok(ReleaseOutcome::Removed(outcome))
    }

    /// Poller used for waits.
    pub fn poller(&self) -> &LifecyclePoller {
        &self.poller
    }

    /// Ref-count manager used for sharing.
    pub fn refs(&self) -> &RefCountManager {
        &self.refs
    }

    async fn share(&self, name: &str, namespace: &str, timeout: Duration) -> Result<RuntimeInstance> {
        let count = self.refs.increment(name, namespace).await?;
        tracing::info!(pod = %name, refs = count, "Sharing existing shadow pod");
        self.poller.wait_until_running(name, namespace, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::PodPhase;
    use crate::memory::MemoryPodStore;

    const NS: &str = "default";
    const TIMEOUT: Duration = Duration::from_secs(60);

    fn setup() -> (Arc<MemoryPodStore>, SharedInstances) {
        let store = Arc::new(MemoryPodStore::new());
        let shared = SharedInstances::new(store.clone(), PollConfig::default(), ConflictRetryPolicy::default());
        (store, shared)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_creates_with_one_ref() {
        let (store, shared) = setup();
        store.queue_phases("shadow-a", NS, [PodPhase::Pending, PodPhase::Running]);

        let pod = shared
            .acquire(ResourceMeta::new("shadow-a", NS), DesiredInstanceSpec::new("busybox"), TIMEOUT)
            .await
            .unwrap();

        assert!(pod.is_running());
        assert_eq!(pod.ref_count(), Some("1"));
        assert_eq!(pod.meta.labels.get(COMPONENT_LABEL).map(String::as_str), Some(COMPONENT_SHADOW));
        assert!(pod.meta.annotation(HEARTBEAT_ANNOTATION).is_some());
        assert_eq!(store.stats().creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_acquire_shares() {
        let (store, shared) = setup();
        store.queue_phases("shadow-a", NS, [PodPhase::Running]);
        let meta = ResourceMeta::new("shadow-a", NS);

        shared
            .acquire(meta.clone(), DesiredInstanceSpec::new("busybox"), TIMEOUT)
            .await
            .unwrap();
        let pod = shared
            .acquire(meta, DesiredInstanceSpec::new("busybox"), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(pod.ref_count(), Some("2"));
        assert_eq!(store.stats().creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_keeps_shared_pod() {
        let (store, shared) = setup();
        store.insert(RuntimeInstance::new(
            ResourceMeta::new("shadow-a", NS).with_annotation(REF_COUNT_ANNOTATION, "2"),
            PodPhase::Running,
        ));

        assert_eq!(shared.release("shadow-a", NS).await.unwrap(), ReleaseOutcome::StillShared);
        assert_eq!(store.peek("shadow-a", NS).unwrap().ref_count(), Some("1"));
        assert_eq!(store.stats().deletes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_release_deletes_and_waits() {
        let (store, shared) = setup();
        store.set_termination_reads(1);
        store.insert(RuntimeInstance::new(
            ResourceMeta::new("shadow-a", NS).with_annotation(REF_COUNT_ANNOTATION, "1"),
            PodPhase::Running,
        ));

        let outcome = shared.release("shadow-a", NS).await.unwrap();

        assert_eq!(outcome, ReleaseOutcome::Removed(TerminateOutcome::Terminated));
        assert!(store.peek("shadow-a", NS).is_none());
        assert_eq!(store.stats().deletes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_out_terminating_pod() {
        let (store, shared) = setup();
        store.set_termination_reads(2);
        store.insert(RuntimeInstance::new(
            ResourceMeta::new("shadow-a", NS).with_annotation(REF_COUNT_ANNOTATION, "1"),
            PodPhase::Running,
        ));
        store.delete("shadow-a", NS).await.unwrap();

        let pod = shared
            .acquire(ResourceMeta::new("shadow-a", NS), DesiredInstanceSpec::new("busybox"), Duration::ZERO)
            .await;

        // Recreated pod starts Pending, and a zero timeout allows a single look.
        assert!(pod.is_err());
        let recreated = store.peek("shadow-a", NS).unwrap();
        assert!(!recreated.is_terminating());
        assert_eq!(recreated.ref_count(), Some("1"));
        assert_eq!(store.stats().creates(), 1);
    }
}
