//! Liveness heartbeat on shadow pods.
//!
//! The heartbeat annotation is advisory: a failed patch is logged and
//! dropped, never returned to the caller.

use crate::instance::HEARTBEAT_ANNOTATION;
use crate::store::PodStore;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically stamps the heartbeat annotation on a pod.
#[derive(Clone)]
pub struct HeartbeatUpdater {
    store: Arc<dyn PodStore>,
}

impl HeartbeatUpdater {
    /// Create an updater over the given store.
    pub fn new(store: Arc<dyn PodStore>) -> Self {
        Self { store }
    }

    /// Stamp the current time on the pod. Returns whether the patch succeeded.
    pub async fn tick(&self, name: &str, namespace: &str) -> bool {
        let now = Utc::now();
        tracing::debug!(pod = %name, at = %now.to_rfc3339(), "Heartbeat pod ticked");
        let patch = BTreeMap::from([(HEARTBEAT_ANNOTATION.to_string(), now.timestamp().to_string())]);
        match self.store.patch_annotations(name, namespace, &patch).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(pod = %name, error = %e, "Failed to update pod heart beat");
                false
            }
        }
    }

    /// Tick immediately and then every `interval` until `cancel` fires.
    pub fn spawn(
        &self,
        name: &str,
        namespace: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let updater = self.clone();
        let name = name.to_string();
        let namespace = namespace.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        tracing::debug!(pod = %name, "Heartbeat stopped");
                        break;
                    }

                    _ = ticker.tick() => {
                        updater.tick(&name, &namespace).await;
                    }
                }
            }
        })
    }
}
