//! # shadow-kube
//!
//! Kubernetes backend for `shadow-core`.
//!
//! [`KubePodStore`] implements both [`shadow_core::PodStore`] and
//! [`shadow_core::ExecTransport`] on top of a `kube` client, so the whole
//! core stack can run against a live cluster:
//!
//! ```ignore
//! use shadow_core::{ExecBridge, LifecyclePoller, ShadowConfig};
//! use shadow_kube::KubePodStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> shadow_core::Result<()> {
//! let config = ShadowConfig::from_env();
//! let store = Arc::new(KubePodStore::try_default().await?);
//!
//! let poller = LifecyclePoller::new(store.clone(), config.poll_config());
//! poller
//!     .wait_until_running("shadow-web", &config.namespace, std::time::Duration::from_secs(60))
//!     .await?;
//!
//! let bridge = ExecBridge::new(store, config.exec_config());
//! let out = bridge.exec("shadow", "shadow-web", &config.namespace, ["ip", "route"]).await?;
//! println!("{}", out.stdout);
//! # Ok(())
//! # }
//! ```

mod convert;
mod store;

pub use convert::{apply_instance, instance_from_pod, pod_from_spec, SHADOW_CONTAINER};
pub use store::KubePodStore;
