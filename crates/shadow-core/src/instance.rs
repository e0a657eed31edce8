//! Pod data model - identity, desired spec and observed runtime snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation holding the number of clients sharing a pod.
pub const REF_COUNT_ANNOTATION: &str = "shadow.io/ref-count";

/// Annotation holding the last heartbeat as unix seconds.
pub const HEARTBEAT_ANNOTATION: &str = "shadow.io/heartbeat";

/// Annotation set to `"true"` on leaf pods.
pub const LEAF_ANNOTATION: &str = "shadow.io/leaf";

/// Label identifying pods created by this crate.
pub const COMPONENT_LABEL: &str = "shadow.io/component";

/// Value of [`COMPONENT_LABEL`] on shadow pods.
pub const COMPONENT_SHADOW: &str = "shadow";

/// Identity of a remote resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// Name, unique within the namespace.
    pub name: String,
    /// Namespace the resource lives in.
    pub namespace: String,
    /// Labels used for selection.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations carrying sideband state (ref count, heartbeat).
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ResourceMeta {
    /// Create metadata with no labels or annotations.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Create metadata with a generated name of the form `<prefix>-<8 hex chars>`.
    pub fn generated(prefix: &str, namespace: impl Into<String>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self::new(format!("{prefix}-{}", &suffix[..8]), namespace)
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an annotation.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Get an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Declarative target for a pod to create.
///
/// Consumed once by value when the pod is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredInstanceSpec {
    /// Container image reference.
    pub image: String,
    /// Environment variables for the container.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Exposed container ports, in order.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Leaf pods do not spawn further dependent pods.
    #[serde(default)]
    pub is_leaf: bool,
}

impl DesiredInstanceSpec {
    /// Create a spec for the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    /// Expose a port.
    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    /// Mark the pod as a leaf.
    pub fn leaf(mut self, is_leaf: bool) -> Self {
        self.is_leaf = is_leaf;
        self
    }
}

/// Lifecycle phase of a pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not all containers are running yet.
    Pending,
    /// Bound to a node with at least one container running.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// All containers terminated, at least one in failure.
    Failed,
    /// State could not be obtained.
    #[default]
    Unknown,
}

impl PodPhase {
    /// Parse a phase string as reported by the cluster. Unrecognised values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of a pod as observed from the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInstance {
    /// Identity, labels and annotations.
    pub meta: ResourceMeta,
    /// Observed phase.
    pub phase: PodPhase,
    /// Set once deletion has been requested.
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Store version this snapshot was read at.
    pub resource_version: Option<String>,
}

impl RuntimeInstance {
    /// Create a snapshot in the given phase.
    pub fn new(meta: ResourceMeta, phase: PodPhase) -> Self {
        Self {
            meta,
            phase,
            deletion_timestamp: None,
            resource_version: None,
        }
    }

    /// Pod name.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Pod namespace.
    pub fn namespace(&self) -> &str {
        &self.meta.namespace
    }

    /// True when the pod is in the Running phase.
    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }

    /// True once deletion has been requested.
    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Raw ref-count annotation, if present.
    pub fn ref_count(&self) -> Option<&str> {
        self.meta.annotation(REF_COUNT_ANNOTATION)
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    /// Create an empty selector (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// True when every required label is present with the same value.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Iterate over the required labels.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// True when no labels are required.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for LabelSelector {
    fn from(labels: BTreeMap<String, String>) -> Self {
        Self(labels)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// A change observed on a watched pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Pod appeared.
    Added(RuntimeInstance),
    /// Pod changed.
    Modified(RuntimeInstance),
    /// Pod disappeared.
    Deleted(RuntimeInstance),
}

impl WatchEvent {
    /// The snapshot carried by the event.
    pub fn instance(&self) -> &RuntimeInstance {
        match self {
            Self::Added(i) | Self::Modified(i) | Self::Deleted(i) => i,
        }
    }

    /// Consume the event, returning its snapshot.
    pub fn into_instance(self) -> RuntimeInstance {
        match self {
            Self::Added(i) | Self::Modified(i) | Self::Deleted(i) => i,
        }
    }

    /// Short event kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
        }
    }
}
