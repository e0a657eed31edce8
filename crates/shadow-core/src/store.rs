//! Ports to the external resource store and exec transport.
//!
//! Everything in this crate talks to the cluster through these two traits,
//! so tests can swap in [`MemoryPodStore`](crate::MemoryPodStore) or a fake
//! transport while production wires up a real client.

use crate::error::Result;
use crate::instance::{DesiredInstanceSpec, LabelSelector, ResourceMeta, RuntimeInstance, WatchEvent};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;

/// Stream of watch events produced by [`PodStore::watch`].
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// What a watch subscription is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// A single pod by name.
    Name(String),
    /// Every pod matching the selector.
    Selector(LabelSelector),
}

impl WatchTarget {
    /// True when the given pod falls inside this target.
    pub fn matches(&self, instance: &RuntimeInstance) -> bool {
        match self {
            Self::Name(name) => instance.name() == name,
            Self::Selector(selector) => selector.matches(&instance.meta.labels),
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name={name}"),
            Self::Selector(selector) => write!(f, "selector={selector}"),
        }
    }
}

/// Pod operations of the external resource store.
#[async_trait]
pub trait PodStore: Send + Sync {
    /// Fetch a pod. Absent pods yield [`CoreError::NotFound`](crate::CoreError::NotFound).
    async fn get(&self, name: &str, namespace: &str) -> Result<RuntimeInstance>;

    /// List pods matching a selector.
    async fn list(&self, selector: &LabelSelector, namespace: &str) -> Result<Vec<RuntimeInstance>>;

    /// Create a pod from its metadata and desired spec.
    async fn create(&self, meta: ResourceMeta, spec: DesiredInstanceSpec) -> Result<RuntimeInstance>;

    /// Replace a pod's labels and annotations.
    ///
    /// Fails with [`CoreError::Conflict`](crate::CoreError::Conflict) when the
    /// snapshot's resource version is stale.
    async fn update(&self, instance: &RuntimeInstance) -> Result<RuntimeInstance>;

    /// Merge annotations into a pod without a version check.
    async fn patch_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Delete a pod with background propagation.
    async fn delete(&self, name: &str, namespace: &str) -> Result<()>;

    /// Open a watch stream.
    async fn watch(&self, target: &WatchTarget, namespace: &str) -> Result<WatchStream>;
}

/// A command to run inside a pod container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Target pod.
    pub pod: String,
    /// Target namespace.
    pub namespace: String,
    /// Target container.
    pub container: String,
    /// argv of the command.
    pub command: Vec<String>,
    /// Attach stdin.
    pub stdin: bool,
    /// Capture stdout.
    pub stdout: bool,
    /// Capture stderr.
    pub stderr: bool,
    /// Allocate a TTY.
    pub tty: bool,
}

impl ExecRequest {
    /// Build a non-interactive request capturing stdout and stderr.
    pub fn capture(
        container: impl Into<String>,
        pod: impl Into<String>,
        namespace: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            pod: pod.into(),
            namespace: namespace.into(),
            container: container.into(),
            command,
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
        }
    }
}

/// Multiplexed exec stream to a running pod.
#[async_trait]
pub trait ExecTransport: Send + Sync {
    /// Run the command, filling the output buffers, and return once it terminates.
    async fn stream(
        &self,
        request: &ExecRequest,
        stdout: &mut Vec<u8>,
        stderr: &mut Vec<u8>,
    ) -> Result<()>;
}
