//! Annotation-based reference counting for shared pods.
//!
//! The count lives in the [`REF_COUNT_ANNOTATION`] annotation as a decimal
//! string. Updates are read-modify-write against the latest snapshot; when
//! the store reports a conflict the whole cycle is retried from a fresh read,
//! up to [`ConflictRetryPolicy::max_retries`] times.

use crate::error::{CoreError, Result};
use crate::instance::REF_COUNT_ANNOTATION;
use crate::store::PodStore;
use std::sync::Arc;

/// How many times a conflicting ref-count update is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetryPolicy {
    /// Retries after the first conflicting update. Zero disables retrying.
    pub max_retries: u32,
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Increments and decrements the ref-count annotation of a pod.
pub struct RefCountManager {
    store: Arc<dyn PodStore>,
    policy: ConflictRetryPolicy,
}

impl RefCountManager {
    /// Create a manager over the given store.
    pub fn new(store: Arc<dyn PodStore>, policy: ConflictRetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Increase the ref count by one and return the new count.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Parse`] if the annotation is missing, not an integer or already `u64::MAX`; nothing is written
    /// - [`CoreError::Conflict`] once conflict retries are spent
    /// - any fetch or update error
    pub async fn increment(&self, name: &str, namespace: &str) -> Result<u64> {
        let mut conflicts = 0u32;
        loop {
            let mut pod = self.store.get(name, namespace).await?;
            let raw = pod.ref_count().unwrap_or_default().to_string();
            let count: u64 = raw.parse().map_err(|_| {
                tracing::error!(
                    pod = %name,
                    key = REF_COUNT_ANNOTATION,
                    value = %raw,
                    "Failed to parse ref count annotation"
                );
                CoreError::Parse {
                    name: name.to_string(),
                    key: REF_COUNT_ANNOTATION.to_string(),
                    value: raw.clone(),
                }
            })?;

            let next = count.checked_add(1).ok_or_else(|| {
                tracing::error!(pod = %name, value = %raw, "Ref count annotation at maximum");
                CoreError::Parse {
                    name: name.to_string(),
                    key: REF_COUNT_ANNOTATION.to_string(),
                    value: raw.clone(),
                }
            })?;
            pod.meta
                .annotations
                .insert(REF_COUNT_ANNOTATION.to_string(), next.to_string());

            match self.store.update(&pod).await {
                Ok(_) => {
                    tracing::info!(pod = %name, from = count, to = next, "Increased pod ref count");
                    return Ok(next);
                }
                Err(e) if e.is_conflict() && conflicts < self.policy.max_retries => {
                    conflicts += 1;
                    tracing::debug!(pod = %name, conflicts, "Ref count update conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Decrease the ref count by one.
    ///
    /// Returns `true` without touching the pod when this caller holds the last
    /// reference; deleting the pod is then up to the caller.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ContractViolation`] if the count is zero, missing or not an integer; nothing is written
    /// - [`CoreError::Conflict`] once conflict retries are spent
    /// - any fetch or update error
    pub async fn decrement(&self, name: &str, namespace: &str) -> Result<bool> {
        let mut conflicts = 0u32;
        loop {
            let mut pod = self.store.get(name, namespace).await?;
            let raw = pod.ref_count().unwrap_or_default().to_string();
            if raw == "1" {
                tracing::info!(pod = %name, "Pod has only one ref, gonna remove");
                return Ok(true);
            }

            let count = match raw.parse::<u64>() {
                Ok(0) => return Err(contract_violation(name, "ref count is already zero")),
                Ok(count) => count,
                Err(_) => {
                    return Err(contract_violation(
                        name,
                        &format!("ref count {raw:?} is not a number"),
                    ))
                }
            };

            let next = count - 1;
            pod.meta
                .annotations
                .insert(REF_COUNT_ANNOTATION.to_string(), next.to_string());

            match self.store.update(&pod).await {
                Ok(_) => {
                    tracing::info!(pod = %name, from = count, to = next, "Decreased pod ref count");
                    return Ok(false);
                }
                Err(e) if e.is_conflict() && conflicts < self.policy.max_retries => {
                    conflicts += 1;
                    tracing::debug!(pod = %name, conflicts, "Ref count update conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn contract_violation(name: &str, reason: &str) -> CoreError {
    tracing::error!(pod = %name, reason, "Invalid ref count on decrement");
    CoreError::ContractViolation {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{PodPhase, ResourceMeta, RuntimeInstance};
    use crate::memory::MemoryPodStore;

    const NS: &str = "default";

    fn setup(ref_count: Option<&str>) -> (Arc<MemoryPodStore>, RefCountManager) {
        let store = Arc::new(MemoryPodStore::new());
        let mut meta = ResourceMeta::new("shared", NS);
        if let Some(count) = ref_count {
            meta = meta.with_annotation(REF_COUNT_ANNOTATION, count);
        }
        store.insert(RuntimeInstance::new(meta, PodPhase::Running));
        let manager = RefCountManager::new(store.clone(), ConflictRetryPolicy::default());
        (store, manager)
    }

    fn stored_count(store: &MemoryPodStore) -> Option<String> {
        store
            .peek("shared", NS)
            .and_then(|p| p.ref_count().map(str::to_string))
    }

    #[tokio::test]
    async fn test_increment() {
        let (store, manager) = setup(Some("2"));
        assert_eq!(manager.increment("shared", NS).await.unwrap(), 3);
        assert_eq!(stored_count(&store).as_deref(), Some("3"));
        assert_eq!(store.stats().updates(), 1);
    }

    #[tokio::test]
    async fn test_increment_malformed_is_parse_error_without_write() {
        let (store, manager) = setup(Some("abc"));
        let err = manager.increment("shared", NS).await.unwrap_err();
        assert!(matches!(err, CoreError::Parse { ref value, .. } if value == "abc"));
        assert_eq!(store.stats().writes(), 0);
    }

    #[tokio::test]
    async fn test_increment_missing_is_parse_error() {
        let (store, manager) = setup(None);
        assert!(matches!(
            manager.increment("shared", NS).await,
            Err(CoreError::Parse { .. })
        ));
        assert_eq!(store.stats().writes(), 0);
    }

    #[tokio::test]
    async fn test_increment_at_max_is_parse_error_without_write() {
        let max = u64::MAX.to_string();
        let (store, manager) = setup(Some(&max));
        let err = manager.increment("shared", NS).await.unwrap_err();
        assert!(matches!(err, CoreError::Parse { ref value, .. } if *value == max));
        assert_eq!(store.stats().writes(), 0);
        assert_eq!(stored_count(&store), Some(max));
    }

    #[tokio::test]
    async fn test_decrement_last_ref_writes_nothing() {
        let (store, manager) = setup(Some("1"));
        assert!(manager.decrement("shared", NS).await.unwrap());
        assert_eq!(store.stats().writes(), 0);
        assert_eq!(stored_count(&store).as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_decrement() {
        let (store, manager) = setup(Some("3"));
        assert!(!manager.decrement("shared", NS).await.unwrap());
        assert_eq!(stored_count(&store).as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_decrement_invalid_counts_are_contract_violations() {
        for raw in ["0", "x", ""] {
            let (store, manager) = setup(Some(raw));
            let err = manager.decrement("shared", NS).await.unwrap_err();
            assert!(matches!(err, CoreError::ContractViolation { .. }), "value {raw:?}");
            assert_eq!(store.stats().writes(), 0);
        }
    }

    #[tokio::test]
    async fn test_increment_then_decrement_restores_count() {
        let (store, manager) = setup(Some("4"));
        manager.increment("shared", NS).await.unwrap();
        assert!(!manager.decrement("shared", NS).await.unwrap());
        assert_eq!(stored_count(&store).as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_conflict_is_retried_from_fresh_read() {
        let (store, manager) = setup(Some("1"));
        store.inject_conflicts(2);
        assert_eq!(manager.increment("shared", NS).await.unwrap(), 2);
        assert_eq!(store.stats().gets(), 3);
        assert_eq!(stored_count(&store).as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_conflict_without_retries_propagates() {
        let store = Arc::new(MemoryPodStore::new());
        store.insert(RuntimeInstance::new(
            ResourceMeta::new("shared", NS).with_annotation(REF_COUNT_ANNOTATION, "2"),
            PodPhase::Running,
        ));
        let manager = RefCountManager::new(store.clone(), ConflictRetryPolicy { max_retries: 0 });
        store.inject_conflicts(1);

        assert!(manager.decrement("shared", NS).await.unwrap_err().is_conflict());
        assert_eq!(stored_count(&store).as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_missing_pod_propagates_not_found() {
        let store = Arc::new(MemoryPodStore::new());
        let manager = RefCountManager::new(store, ConflictRetryPolicy::default());
        assert!(manager.increment("ghost", NS).await.unwrap_err().is_not_found());
        assert!(manager.decrement("ghost", NS).await.unwrap_err().is_not_found());
    }
}
