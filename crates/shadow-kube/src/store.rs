//! [`PodStore`] and [`ExecTransport`] over the Kubernetes API.

use crate::convert::{apply_instance, instance_from_pod, pod_from_spec};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{
    Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchParams,
};
use kube::Client;
use shadow_core::{
    CoreError, DesiredInstanceSpec, ExecRequest, ExecTransport, LabelSelector, PodStore,
    ResourceMeta, Result, RuntimeInstance, WatchEvent, WatchStream, WatchTarget,
};
use std::collections::BTreeMap;
use tokio::io::AsyncReadExt;

/// Pod store backed by a Kubernetes client.
#[derive(Clone)]
pub struct KubePodStore {
    client: Client,
}

impl KubePodStore {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| CoreError::Store(format!("failed to create kube client: {e}")))?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a kube error onto the core taxonomy.
fn map_kube_error(e: kube::Error, what: &str) -> CoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => CoreError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => CoreError::Conflict(format!("{what}: {}", ae.message)),
        other => CoreError::Store(other.to_string()),
    }
}

#[async_trait]
impl PodStore for KubePodStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<RuntimeInstance> {
        let pod = self
            .pods(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, &format!("pod {name}")))?;
        Ok(instance_from_pod(&pod))
    }

    async fn list(&self, selector: &LabelSelector, namespace: &str) -> Result<Vec<RuntimeInstance>> {
        let params = ListParams::default().labels(&selector.to_string());
        let pods = self
            .pods(namespace)
            .list(&params)
            .await
            .map_err(|e| map_kube_error(e, &format!("pod with label {selector}")))?;
        Ok(pods.items.iter().map(instance_from_pod).collect())
    }

    async fn create(&self, meta: ResourceMeta, spec: DesiredInstanceSpec) -> Result<RuntimeInstance> {
        let mut meta = meta;
        if spec.is_leaf {
            meta.annotations
                .insert(shadow_core::LEAF_ANNOTATION.to_string(), "true".to_string());
        }
        let pod = pod_from_spec(&meta, &spec);
        tracing::debug!(pod = %meta.name, image = %spec.image, "Creating pod");
        let created = self
            .pods(&meta.namespace)
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| map_kube_error(e, &format!("pod {}", meta.name)))?;
        Ok(instance_from_pod(&created))
    }

    async fn update(&self, instance: &RuntimeInstance) -> Result<RuntimeInstance> {
        let name = instance.name();
        let api = self.pods(instance.namespace());
        let what = format!("pod {name}");

        let mut pod = api.get(name).await.map_err(|e| map_kube_error(e, &what))?;
        apply_instance(&mut pod, instance);
        let replaced = api
            .replace(name, &PostParams::default(), &pod)
            .await
            .map_err(|e| map_kube_error(e, &what))?;
        Ok(instance_from_pod(&replaced))
    }

    async fn patch_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "annotations": annotations }
        });
        self.pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(e, &format!("pod {name}")))?;
        Ok(())
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| map_kube_error(e, &format!("pod {name}")))?;
        Ok(())
    }

    async fn watch(&self, target: &WatchTarget, namespace: &str) -> Result<WatchStream> {
        let params = match target {
            WatchTarget::Name(name) => WatchParams::default().fields(&format!("metadata.name={name}")),
            WatchTarget::Selector(selector) => WatchParams::default().labels(&selector.to_string()),
        };
        let stream = self
            .pods(namespace)
            .watch(&params, "0")
            .await
            .map_err(|e| map_kube_error(e, &format!("pods matching {target}")))?;

        let events = stream
            .map_err(|e| CoreError::Store(format!("watch stream failed: {e}")))
            .try_filter_map(|event| async move {
                match event {
                    kube::api::WatchEvent::Added(pod) => Ok(Some(WatchEvent::Added(instance_from_pod(&pod)))),
                    kube::api::WatchEvent::Modified(pod) => {
                        Ok(Some(WatchEvent::Modified(instance_from_pod(&pod))))
                    }
                    kube::api::WatchEvent::Deleted(pod) => {
                        Ok(Some(WatchEvent::Deleted(instance_from_pod(&pod))))
                    }
                    kube::api::WatchEvent::Bookmark(_) => Ok(None),
                    kube::api::WatchEvent::Error(e) => {
                        Err(CoreError::Store(format!("watch error {}: {}", e.code, e.message)))
                    }
                }
            });
        Ok(events.boxed())
    }
}

#[async_trait]
impl ExecTransport for KubePodStore {
    async fn stream(&self, request: &ExecRequest, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) -> Result<()> {
        let params = AttachParams::default()
            .container(request.container.clone())
            .stdin(request.stdin)
            .stdout(request.stdout)
            .stderr(request.stderr)
            .tty(request.tty);

        let mut process = self
            .pods(&request.namespace)
            .exec(&request.pod, request.command.clone(), &params)
            .await
            .map_err(|e| map_kube_error(e, &format!("pod {}", request.pod)))?;

        let out_reader = process.stdout();
        let err_reader = process.stderr();
        let status = process.take_status();

        let read_out = async {
            match out_reader {
                Some(mut r) => r.read_to_end(stdout).await.map(|_| ()),
                None => Ok(()),
            }
        };
        let read_err = async {
            match err_reader {
                Some(mut r) => r.read_to_end(stderr).await.map(|_| ()),
                None => Ok(()),
            }
        };
        let (out_res, err_res) = tokio::join!(read_out, read_err);
        out_res.map_err(|e| CoreError::Store(format!("failed to read stdout: {e}")))?;
        err_res.map_err(|e| CoreError::Store(format!("failed to read stderr: {e}")))?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        process
            .join()
            .await
            .map_err(|e| CoreError::Store(format!("exec session failed: {e}")))?;

        match status {
            Some(s) if s.status.as_deref() == Some("Failure") => Err(CoreError::Store(
                s.message.unwrap_or_else(|| "command failed".to_string()),
            )),
            _ => Ok(()),
        }
    }
}
