//! Conversions between Kubernetes pods and shadow-core snapshots.

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use shadow_core::{DesiredInstanceSpec, PodPhase, ResourceMeta, RuntimeInstance};

/// Name of the single container in a shadow pod.
pub const SHADOW_CONTAINER: &str = "shadow";

/// Snapshot a Kubernetes pod. Missing fields become empty values.
pub fn instance_from_pod(pod: &Pod) -> RuntimeInstance {
    let meta = &pod.metadata;
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(PodPhase::parse)
        .unwrap_or_default();

    RuntimeInstance {
        meta: ResourceMeta {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
        },
        phase,
        deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0),
        resource_version: meta.resource_version.clone(),
    }
}

/// Build the pod object to create for `meta` and `spec`.
pub fn pod_from_spec(meta: &ResourceMeta, spec: &DesiredInstanceSpec) -> Pod {
    let env: Vec<EnvVar> = spec
        .envs
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let ports: Vec<ContainerPort> = spec
        .ports
        .iter()
        .map(|port| ContainerPort {
            container_port: i32::from(*port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: ObjectMeta {
            name: Some(meta.name.clone()),
            namespace: Some(meta.namespace.clone()),
            labels: (!meta.labels.is_empty()).then(|| meta.labels.clone()),
            annotations: (!meta.annotations.is_empty()).then(|| meta.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: SHADOW_CONTAINER.to_string(),
                image: Some(spec.image.clone()),
                env: (!env.is_empty()).then_some(env),
                ports: (!ports.is_empty()).then_some(ports),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Copy labels, annotations and resource version of `instance` onto `pod`.
pub fn apply_instance(pod: &mut Pod, instance: &RuntimeInstance) {
    pod.metadata.labels = Some(instance.meta.labels.clone());
    pod.metadata.annotations = Some(instance.meta.annotations.clone());
    if instance.resource_version.is_some() {
        pod.metadata.resource_version = instance.resource_version.clone();
    }
}
