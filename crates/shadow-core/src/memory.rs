//! In-process pod store.
//!
//! `MemoryPodStore` keeps pods in a map with monotonically increasing
//! resource versions and honours the same contracts as a real cluster:
//! stale updates conflict, deletes may linger in a terminating state, and
//! every write is broadcast to open watch streams. Since there is no
//! kubelet, phase transitions are driven explicitly with
//! [`set_phase`](MemoryPodStore::set_phase) or queued with
//! [`queue_phases`](MemoryPodStore::queue_phases).

use crate::error::{CoreError, Result};
use crate::instance::{
    DesiredInstanceSpec, LabelSelector, PodPhase, ResourceMeta, RuntimeInstance, WatchEvent,
    LEAF_ANNOTATION,
};
use crate::store::{PodStore, WatchStream, WatchTarget};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Capacity of the watch broadcast channel.
const WATCH_BUFFER_SIZE: usize = 256;

type PodKey = (String, String);

fn key(name: &str, namespace: &str) -> PodKey {
    (namespace.to_string(), name.to_string())
}

struct StoredPod {
    instance: RuntimeInstance,
    spec: Option<DesiredInstanceSpec>,
    /// Reads left before a terminating pod disappears.
    linger: u32,
}

struct Inner {
    pods: HashMap<PodKey, StoredPod>,
    scripted: HashMap<PodKey, VecDeque<PodPhase>>,
    next_version: u64,
    pending_conflicts: u32,
    fail_patches: bool,
    termination_reads: u32,
    watch_tx: broadcast::Sender<(String, WatchEvent)>,
}

/// Operation counters for assertions in tests and diagnostics.
#[derive(Debug, Default)]
pub struct StoreStats {
    /// `get` calls.
    pub gets: AtomicU64,
    /// `list` calls.
    pub lists: AtomicU64,
    /// `create` calls that succeeded.
    pub creates: AtomicU64,
    /// `update` calls that were applied.
    pub updates: AtomicU64,
    /// `patch_annotations` calls that were applied.
    pub patches: AtomicU64,
    /// `delete` calls that were applied.
    pub deletes: AtomicU64,
}

impl StoreStats {
    /// Get the number of reads of a single pod.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Get the number of list calls.
    pub fn lists(&self) -> u64 {
        self.lists.load(Ordering::Relaxed)
    }

    /// Get the number of pods created.
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    /// Get the number of applied updates.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Get the number of applied patches.
    pub fn patches(&self) -> u64 {
        self.patches.load(Ordering::Relaxed)
    }

    /// Get the number of applied deletes.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Total writes of any kind.
    pub fn writes(&self) -> u64 {
        self.creates() + self.updates() + self.patches() + self.deletes()
    }
}

/// In-memory [`PodStore`].
pub struct MemoryPodStore {
    inner: Mutex<Inner>,
    stats: StoreStats,
}

impl Default for MemoryPodStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPodStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            inner: Mutex::new(Inner {
                pods: HashMap::new(),
                scripted: HashMap::new(),
                next_version: 1,
                pending_conflicts: 0,
                fail_patches: false,
                termination_reads: 0,
                watch_tx,
            }),
            stats: StoreStats::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Operation counters.
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Insert or overwrite a pod snapshot, broadcasting `Added`.
    pub fn insert(&self, mut instance: RuntimeInstance) -> RuntimeInstance {
        let mut inner = self.lock();
        inner.stamp(&mut instance);
        let k = key(instance.name(), instance.namespace());
        inner.pods.insert(
            k,
            StoredPod {
                instance: instance.clone(),
                spec: None,
                linger: 0,
            },
        );
        inner.emit(WatchEvent::Added(instance.clone()));
        instance
    }

    /// Current snapshot of a pod without counting as a read or advancing scripts.
    pub fn peek(&self, name: &str, namespace: &str) -> Option<RuntimeInstance> {
        self.lock()
            .pods
            .get(&key(name, namespace))
            .map(|p| p.instance.clone())
    }

    /// Spec the pod was created with, if it was created through [`PodStore::create`].
    pub fn spec_of(&self, name: &str, namespace: &str) -> Option<DesiredInstanceSpec> {
        self.lock()
            .pods
            .get(&key(name, namespace))
            .and_then(|p| p.spec.clone())
    }

    /// Move a pod to a new phase, broadcasting `Modified`.
    pub fn set_phase(&self, name: &str, namespace: &str, phase: PodPhase) -> Result<()> {
        let mut inner = self.lock();
        inner.transition(&key(name, namespace), phase)
    }

    /// Queue phases applied one per subsequent read of the pod.
    pub fn queue_phases(&self, name: &str, namespace: &str, phases: impl IntoIterator<Item = PodPhase>) {
        self.lock()
            .scripted
            .entry(key(name, namespace))
            .or_default()
            .extend(phases);
    }

    /// Remove a pod outright, as if deleted by someone else, broadcasting `Deleted`.
    pub fn remove(&self, name: &str, namespace: &str) -> Option<RuntimeInstance> {
        let mut inner = self.lock();
        let removed = inner.pods.remove(&key(name, namespace)).map(|p| p.instance);
        if let Some(instance) = &removed {
            inner.emit(WatchEvent::Deleted(instance.clone()));
        }
        removed
    }

    /// Make the next `n` updates fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.lock().pending_conflicts = n;
    }

    /// Make annotation patches fail.
    pub fn fail_patches(&self, fail: bool) {
        self.lock().fail_patches = fail;
    }

    /// Number of reads a deleted pod stays visible as terminating.
    pub fn set_termination_reads(&self, reads: u32) {
        self.lock().termination_reads = reads;
    }

    /// Close every open watch stream.
    pub fn disconnect_watchers(&self) {
        let (watch_tx, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        self.lock().watch_tx = watch_tx;
    }

    /// Number of open watch streams.
    pub fn watcher_count(&self) -> usize {
        self.lock().watch_tx.receiver_count()
    }
}

impl Inner {
    fn stamp(&mut self, instance: &mut RuntimeInstance) {
        instance.resource_version = Some(self.next_version.to_string());
        self.next_version += 1;
    }

    fn emit(&self, event: WatchEvent) {
        let namespace = event.instance().namespace().to_string();
        // No receivers is fine
        let _ = self.watch_tx.send((namespace, event));
    }

    fn transition(&mut self, k: &PodKey, phase: PodPhase) -> Result<()> {
        let mut instance = {
            let pod = self
                .pods
                .get(k)
                .ok_or_else(|| CoreError::NotFound(format!("pod {}", k.1)))?;
            pod.instance.clone()
        };
        if instance.phase == phase {
            return Ok(());
        }
        instance.phase = phase;
        self.stamp(&mut instance);
        if let Some(pod) = self.pods.get_mut(k) {
            pod.instance = instance.clone();
        }
        self.emit(WatchEvent::Modified(instance));
        Ok(())
    }

    /// Apply scripted phases and termination progress for one observation.
    fn observe(&mut self, k: &PodKey) -> Option<RuntimeInstance> {
        if !self.pods.contains_key(k) {
            return None;
        }
        let next_phase = self.scripted.get_mut(k).and_then(VecDeque::pop_front);
        if let Some(phase) = next_phase {
            let _ = self.transition(k, phase);
        }

        let pod = self.pods.get_mut(k)?;
        if pod.instance.is_terminating() {
            if pod.linger == 0 {
                let removed = self.pods.remove(k).map(|p| p.instance);
                if let Some(instance) = removed {
                    self.emit(WatchEvent::Deleted(instance));
                }
                return None;
            }
            pod.linger -= 1;
        }
        Some(pod.instance.clone())
    }
}

#[async_trait]
impl PodStore for MemoryPodStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<RuntimeInstance> {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .observe(&key(name, namespace))
            .ok_or_else(|| CoreError::NotFound(format!("pod {name}")))
    }

    async fn list(&self, selector: &LabelSelector, namespace: &str) -> Result<Vec<RuntimeInstance>> {
        self.stats.lists.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        let mut keys: Vec<PodKey> = inner
            .pods
            .iter()
            .filter(|(k, p)| k.0 == namespace && selector.matches(&p.instance.meta.labels))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys.iter().filter_map(|k| inner.observe(k)).collect())
    }

    async fn create(&self, meta: ResourceMeta, spec: DesiredInstanceSpec) -> Result<RuntimeInstance> {
        let mut inner = self.lock();
        let k = key(&meta.name, &meta.namespace);
        if inner.pods.contains_key(&k) {
            return Err(CoreError::Conflict(format!("{} already exists", meta.name)));
        }
        let mut meta = meta;
        if spec.is_leaf {
            meta.annotations
                .insert(LEAF_ANNOTATION.to_string(), "true".to_string());
        }
        let mut instance = RuntimeInstance::new(meta, PodPhase::Pending);
        inner.stamp(&mut instance);
        inner.pods.insert(
            k,
            StoredPod {
                instance: instance.clone(),
                spec: Some(spec),
                linger: 0,
            },
        );
        self.stats.creates.fetch_add(1, Ordering::Relaxed);
        inner.emit(WatchEvent::Added(instance.clone()));
        Ok(instance)
    }

    async fn update(&self, instance: &RuntimeInstance) -> Result<RuntimeInstance> {
        let mut inner = self.lock();
        let k = key(instance.name(), instance.namespace());
        let current = inner
            .pods
            .get(&k)
            .map(|p| p.instance.clone())
            .ok_or_else(|| CoreError::NotFound(format!("pod {}", instance.name())))?;

        if inner.pending_conflicts > 0 {
            inner.pending_conflicts -= 1;
            return Err(CoreError::Conflict(instance.name().to_string()));
        }
        if instance.resource_version.is_some() && instance.resource_version != current.resource_version {
            return Err(CoreError::Conflict(instance.name().to_string()));
        }

        let mut updated = current;
        updated.meta.labels = instance.meta.labels.clone();
        updated.meta.annotations = instance.meta.annotations.clone();
        inner.stamp(&mut updated);
        if let Some(pod) = inner.pods.get_mut(&k) {
            pod.instance = updated.clone();
        }
        self.stats.updates.fetch_add(1, Ordering::Relaxed);
        inner.emit(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn patch_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_patches {
            return Err(CoreError::Store("patch rejected".into()));
        }
        let k = key(name, namespace);
        let mut instance = inner
            .pods
            .get(&k)
            .map(|p| p.instance.clone())
            .ok_or_else(|| CoreError::NotFound(format!("pod {name}")))?;
        instance
            .meta
            .annotations
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        inner.stamp(&mut instance);
        if let Some(pod) = inner.pods.get_mut(&k) {
            pod.instance = instance.clone();
        }
        self.stats.patches.fetch_add(1, Ordering::Relaxed);
        inner.emit(WatchEvent::Modified(instance));
        Ok(())
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<()> {
        let mut inner = self.lock();
        let k = key(name, namespace);
        let linger = inner.termination_reads;
        if !inner.pods.contains_key(&k) {
            return Err(CoreError::NotFound(format!("pod {name}")));
        }
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);

        if linger == 0 {
            if let Some(pod) = inner.pods.remove(&k) {
                inner.emit(WatchEvent::Deleted(pod.instance));
            }
            return Ok(());
        }

        let mut instance = match inner.pods.get(&k) {
            Some(pod) if pod.instance.is_terminating() => return Ok(()),
            Some(pod) => pod.instance.clone(),
            None => return Ok(()),
        };
        instance.deletion_timestamp = Some(Utc::now());
        inner.stamp(&mut instance);
        if let Some(pod) = inner.pods.get_mut(&k) {
            pod.instance = instance.clone();
            pod.linger = linger;
        }
        inner.emit(WatchEvent::Modified(instance));
        Ok(())
    }

    async fn watch(&self, target: &WatchTarget, namespace: &str) -> Result<WatchStream> {
        let rx = self.lock().watch_tx.subscribe();
        let target = target.clone();
        let namespace = namespace.to_string();

        let stream = futures::stream::unfold(rx, move |mut rx| {
            let target = target.clone();
            let namespace = namespace.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((ns, event)) => {
                            if ns == namespace && target.matches(event.instance()) {
                                return Some((Ok::<_, CoreError>(event), rx));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Memory watch lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
