//! # shadow-core
//!
//! Lifecycle orchestration for shadow pods: short-lived helper pods that
//! sit next to a workload and are shared between the clients using them.
//!
//! The crate speaks to the cluster only through two ports, [`PodStore`] and
//! [`ExecTransport`]. `shadow-kube` implements both against the Kubernetes
//! API; [`MemoryPodStore`] implements the store in-process for tests.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     shadow-core                          │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌──────────────────┐     ┌──────────────────────────┐   │
//! │  │ SharedInstances  │────▶│  RefCountManager         │   │
//! │  │  - acquire()     │     │  - increment()           │   │
//! │  │  - release()     │     │  - decrement()           │   │
//! │  └──────────────────┘     └──────────────────────────┘   │
//! │           │                            │                 │
//! │           ▼                            │                 │
//! │  ┌──────────────────┐                  │                 │
//! │  │ LifecyclePoller  │                  │                 │
//! │  │  - running       │                  │                 │
//! │  │  - set ready     │                  │                 │
//! │  │  - terminated    │                  │                 │
//! │  └──────────────────┘                  │                 │
//! │           │                            ▼                 │
//! │  ┌──────────────────┐     ┌──────────────────────────┐   │
//! │  │ ResourceWatcher  │────▶│   dyn PodStore           │   │
//! │  │ HeartbeatUpdater │────▶│   get/list/update/watch  │   │
//! │  └──────────────────┘     └──────────────────────────┘   │
//! │                                                          │
//! │  ┌──────────────────┐     ┌──────────────────────────┐   │
//! │  │   ExecBridge     │────▶│   dyn ExecTransport      │   │
//! │  └──────────────────┘     └──────────────────────────┘   │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │              shadow-kube (Kubernetes API)                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use shadow_core::{
//!     DesiredInstanceSpec, MemoryPodStore, ResourceMeta, ShadowConfig, SharedInstances,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> shadow_core::Result<()> {
//! let config = ShadowConfig::from_env();
//! let store = Arc::new(MemoryPodStore::new());
//! let shared = SharedInstances::new(store, config.poll_config(), config.retry_policy());
//!
//! let pod = shared
//!     .acquire(
//!         ResourceMeta::new("shadow-web", &config.namespace),
//!         DesiredInstanceSpec::new("ghcr.io/example/shadow:latest").port(8080),
//!         Duration::from_secs(60),
//!     )
//!     .await?;
//! println!("{} is {}", pod.name(), pod.phase);
//!
//! shared.release(pod.name(), pod.namespace()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lifecycle Waits**: Bounded polling until a pod or pod set is Running, or a pod is gone
//! - **Watches**: Add/modify/delete events over a channel or callbacks, with reconnect
//! - **Sharing**: Annotation ref counts with conflict retry
//! - **Remote Exec**: Captured output with ANSI stripping and embedded error detection
//! - **Heartbeat**: Periodic liveness annotation on shared pods

mod config;
mod error;
mod exec;
mod heartbeat;
mod instance;
mod memory;
mod poller;
mod refcount;
mod sharing;
mod store;
mod watcher;

pub use config::{ConfigError, ShadowConfig, DEFAULT_NAMESPACE};
pub use error::{CoreError, Result};
pub use exec::{extract_error_message, strip_ansi, ExecBridge, ExecConfig, ExecOutput};
pub use heartbeat::{HeartbeatUpdater, DEFAULT_HEARTBEAT_INTERVAL};
pub use instance::{
    DesiredInstanceSpec, LabelSelector, PodPhase, ResourceMeta, RuntimeInstance, WatchEvent,
    COMPONENT_LABEL, COMPONENT_SHADOW, HEARTBEAT_ANNOTATION, LEAF_ANNOTATION, REF_COUNT_ANNOTATION,
};
pub use memory::{MemoryPodStore, StoreStats};
pub use poller::{
    LifecyclePoller, PollConfig, TerminateOutcome, DEFAULT_POLL_INTERVAL,
    DEFAULT_TERMINATE_ATTEMPTS,
};
pub use refcount::{ConflictRetryPolicy, RefCountManager};
pub use sharing::{ReleaseOutcome, SharedInstances};
pub use store::{ExecRequest, ExecTransport, PodStore, WatchStream, WatchTarget};
pub use watcher::{
    ReconnectPolicy, ResourceWatcher, WatchHandle, WatchHandlers, WatchSubscription,
    DEFAULT_EVENT_BUFFER,
};

pub use tokio_util::sync::CancellationToken;
