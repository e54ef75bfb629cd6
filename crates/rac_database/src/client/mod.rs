//! The seam between the reconciliation engine and the API server.
//!
//! Everything the engine does against the cluster goes through [`ClusterClient`],
//! so the engine can be driven by [`KubeClusterClient`] in production and by an
//! in-memory store in tests.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, Pod};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncReadExt;

use crate::api::v1::racdatabase::{RacDatabase, RacDatabaseStatus};
use crate::util::errors::{Error, Result, StdError};

#[cfg(test)]
pub mod mock;

/// Anything the engine reads or writes inside the resource's namespace.
pub trait NamespacedObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> NamespacedObject for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// Result of a command run inside a pod.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[async_trait]
pub trait ClusterClient: Clone + Send + Sync + 'static {
    /// Returns `None` when the object does not exist.
    async fn get_opt<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn create<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Full replace. A stale `metadata.resourceVersion` yields a conflict.
    async fn replace<K: NamespacedObject>(&self, namespace: &str, name: &str, obj: &K) -> Result<K>;

    /// Returns false when the object was already gone.
    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn list<K: NamespacedObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>>;

    /// JSON merge patch against the main resource, used for annotations and spec flags.
    async fn patch_merge<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<K>;

    /// Writes the status subresource, guarded by `resource_version` when given.
    async fn write_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &RacDatabaseStatus,
    ) -> Result<RacDatabase>;

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>>;
    async fn create_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume>;
    async fn delete_pv(&self, name: &str) -> Result<bool>;

    async fn pod_logs(&self, namespace: &str, pod: &str, container: Option<&str>) -> Result<String>;

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput>;
}

/// [`ClusterClient`] backed by a real API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn api<K: NamespacedObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_opt<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        Ok(self.api::<K>(namespace).create(&PostParams::default(), obj).await?)
    }

    async fn replace<K: NamespacedObject>(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .replace(name, &PostParams::default(), obj)
            .await?)
    }

    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.api::<K>(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list<K: NamespacedObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api::<K>(namespace).list(&lp).await?.items)
    }

    async fn patch_merge<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn write_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &RacDatabaseStatus,
    ) -> Result<RacDatabase> {
        // a resourceVersion in the patch body makes the API server reject stale writes with 409
        let mut body = json!({ "status": status });
        if let Some(rv) = resource_version {
            body["metadata"] = json!({ "resourceVersion": rv });
        }
        Ok(self
            .api::<RacDatabase>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await?)
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(pvs.get_opt(name).await?)
    }

    async fn create_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(pvs.create(&PostParams::default(), pv).await?)
    }

    async fn delete_pv(&self, name: &str) -> Result<bool> {
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        match pvs.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pod_logs(&self, namespace: &str, pod: &str, container: Option<&str>) -> Result<String> {
        let pods: Api<Pod> = self.api(namespace);
        let lp = LogParams {
            container: container.map(str::to_string),
            ..LogParams::default()
        };
        Ok(pods.logs(pod, &lp).await?)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = self.api(namespace);
        let mut params = AttachParams::default().stdout(true).stderr(true);
        if let Some(c) = container {
            params = params.container(c);
        }

        let mut attached = pods.exec(pod, command, &params).await?;
        let status = attached.take_status();

        let mut stdout = String::new();
        let mut stderr = String::new();
        let out_reader = attached.stdout();
        let err_reader = attached.stderr();
        let (out_res, err_res) = tokio::join!(
            async {
                match out_reader {
                    Some(mut r) => r.read_to_string(&mut stdout).await.map(|_| ()),
                    None => Ok(()),
                }
            },
            async {
                match err_reader {
                    Some(mut r) => r.read_to_string(&mut stderr).await.map(|_| ()),
                    None => Ok(()),
                }
            }
        );
        out_res
            .and(err_res)
            .map_err(|e| Error::StdError(StdError::ExecError(format!("reading output of {pod}: {e}"))))?;

        let success = match status {
            Some(fut) => fut
                .await
                .map(|s| s.status.as_deref() == Some("Success"))
                .unwrap_or(false),
            None => false,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::StdError(StdError::ExecError(format!("exec in {pod}: {e}"))))?;

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
        })
    }
}
