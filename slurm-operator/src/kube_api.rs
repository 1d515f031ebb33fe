//! Kubernetes access used by the controllers.
//!
//! Reconcilers talk to the API server only through [`KubeApi`], which keeps
//! their logic testable against an in-memory implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ControllerRevision, Deployment};
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crd::{Controller, LoginSet, LoginSetStatus, NodeSet, NodeSetStatus, RestApi};
use crate::error::{OperatorError, OperatorResult};
use crate::key::ObjectKey;
use crate::labels;

/// Every Kubernetes read and write the controllers perform.
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Get a NodeSet.
    async fn get_nodeset(&self, key: &ObjectKey) -> OperatorResult<Option<NodeSet>>;

    /// Write the status subresource of a NodeSet.
    async fn update_nodeset_status(
        &self,
        key: &ObjectKey,
        status: &NodeSetStatus,
    ) -> OperatorResult<()>;

    /// List pods in a namespace matching every selector label.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> OperatorResult<Vec<Pod>>;

    /// List pods scheduled on a Kubernetes node, across namespaces.
    async fn list_pods_on_node(&self, node_name: &str) -> OperatorResult<Vec<Pod>>;

    /// Create a pod.
    async fn create_pod(&self, pod: &Pod) -> OperatorResult<Pod>;

    /// Delete a pod. Missing pods are not an error.
    async fn delete_pod(&self, key: &ObjectKey) -> OperatorResult<()>;

    /// Write the status conditions of a pod.
    async fn update_pod_status(&self, pod: &Pod) -> OperatorResult<()>;

    /// List ControllerRevisions matching every selector label.
    async fn list_revisions(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> OperatorResult<Vec<ControllerRevision>>;

    /// Create a ControllerRevision.
    async fn create_revision(
        &self,
        revision: &ControllerRevision,
    ) -> OperatorResult<ControllerRevision>;

    /// Delete a ControllerRevision. Missing revisions are not an error.
    async fn delete_revision(&self, key: &ObjectKey) -> OperatorResult<()>;

    /// Create a PersistentVolumeClaim.
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> OperatorResult<()>;

    /// Delete a PersistentVolumeClaim. Missing claims are not an error.
    async fn delete_pvc(&self, key: &ObjectKey) -> OperatorResult<()>;

    /// Get a Kubernetes node.
    async fn get_node(&self, name: &str) -> OperatorResult<Option<Node>>;

    /// Get a Controller.
    async fn get_controller(&self, key: &ObjectKey) -> OperatorResult<Option<Controller>>;

    /// List RestApis in a namespace.
    async fn list_restapis(&self, namespace: &str) -> OperatorResult<Vec<RestApi>>;

    /// Get a Deployment.
    async fn get_deployment(&self, key: &ObjectKey) -> OperatorResult<Option<Deployment>>;

    /// Server-side apply a Deployment.
    async fn apply_deployment(&self, deployment: &Deployment) -> OperatorResult<Deployment>;

    /// Get a Secret.
    async fn get_secret(&self, key: &ObjectKey) -> OperatorResult<Option<Secret>>;

    /// Get a LoginSet.
    async fn get_loginset(&self, key: &ObjectKey) -> OperatorResult<Option<LoginSet>>;

    /// Write the status subresource of a LoginSet.
    async fn update_loginset_status(
        &self,
        key: &ObjectKey,
        status: &LoginSetStatus,
    ) -> OperatorResult<()>;
}

/// [`KubeApi`] backed by a live cluster.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    /// Wrap a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn get_optional<K>(api: &Api<K>, name: &str) -> OperatorResult<Option<K>>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn delete_ignore_missing<K>(api: &Api<K>, name: &str) -> OperatorResult<()>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> OperatorResult<()>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
    S: Serialize,
{
    let patch = serde_json::json!({
        "status": status
    });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn selector_params(selector: &BTreeMap<String, String>) -> ListParams {
    ListParams::default().labels(&labels::selector_string(selector))
}

fn require_namespace<K: Resource>(obj: &K) -> OperatorResult<String> {
    obj.namespace().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("{} must be namespaced", obj.name_any()))
    })
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn get_nodeset(&self, key: &ObjectKey) -> OperatorResult<Option<NodeSet>> {
        get_optional(&self.namespaced::<NodeSet>(&key.namespace), &key.name).await
    }

    async fn update_nodeset_status(
        &self,
        key: &ObjectKey,
        status: &NodeSetStatus,
    ) -> OperatorResult<()> {
        patch_status(&self.namespaced::<NodeSet>(&key.namespace), &key.name, status).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> OperatorResult<Vec<Pod>> {
        let pods = self
            .namespaced::<Pod>(namespace)
            .list(&selector_params(selector))
            .await?;
        Ok(pods.items)
    }

    async fn list_pods_on_node(&self, node_name: &str) -> OperatorResult<Vec<Pod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        let pods = Api::<Pod>::all(self.client.clone()).list(&params).await?;
        Ok(pods.items)
    }

    async fn create_pod(&self, pod: &Pod) -> OperatorResult<Pod> {
        let namespace = require_namespace(pod)?;
        let created = self
            .namespaced::<Pod>(&namespace)
            .create(&PostParams::default(), pod)
            .await?;
        Ok(created)
    }

    async fn delete_pod(&self, key: &ObjectKey) -> OperatorResult<()> {
        delete_ignore_missing(&self.namespaced::<Pod>(&key.namespace), &key.name).await
    }

    async fn update_pod_status(&self, pod: &Pod) -> OperatorResult<()> {
        let namespace = require_namespace(pod)?;
        let conditions = pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        let patch = serde_json::json!({
            "status": { "conditions": conditions }
        });
        self.namespaced::<Pod>(&namespace)
            .patch_status(&pod.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_revisions(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> OperatorResult<Vec<ControllerRevision>> {
        let revisions = self
            .namespaced::<ControllerRevision>(namespace)
            .list(&selector_params(selector))
            .await?;
        Ok(revisions.items)
    }

    async fn create_revision(
        &self,
        revision: &ControllerRevision,
    ) -> OperatorResult<ControllerRevision> {
        let namespace = require_namespace(revision)?;
        let created = self
            .namespaced::<ControllerRevision>(&namespace)
            .create(&PostParams::default(), revision)
            .await?;
        Ok(created)
    }

    async fn delete_revision(&self, key: &ObjectKey) -> OperatorResult<()> {
        delete_ignore_missing(
            &self.namespaced::<ControllerRevision>(&key.namespace),
            &key.name,
        )
        .await
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> OperatorResult<()> {
        let namespace = require_namespace(pvc)?;
        match self
            .namespaced::<PersistentVolumeClaim>(&namespace)
            .create(&PostParams::default(), pvc)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pvc(&self, key: &ObjectKey) -> OperatorResult<()> {
        delete_ignore_missing(
            &self.namespaced::<PersistentVolumeClaim>(&key.namespace),
            &key.name,
        )
        .await
    }

    async fn get_node(&self, name: &str) -> OperatorResult<Option<Node>> {
        get_optional(&Api::<Node>::all(self.client.clone()), name).await
    }

    async fn get_controller(&self, key: &ObjectKey) -> OperatorResult<Option<Controller>> {
        get_optional(&self.namespaced::<Controller>(&key.namespace), &key.name).await
    }

    async fn list_restapis(&self, namespace: &str) -> OperatorResult<Vec<RestApi>> {
        let restapis = self
            .namespaced::<RestApi>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(restapis.items)
    }

    async fn get_deployment(&self, key: &ObjectKey) -> OperatorResult<Option<Deployment>> {
        get_optional(&self.namespaced::<Deployment>(&key.namespace), &key.name).await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> OperatorResult<Deployment> {
        let namespace = require_namespace(deployment)?;
        let applied = self
            .namespaced::<Deployment>(&namespace)
            .patch(
                &deployment.name_any(),
                &PatchParams::apply(labels::FIELD_MANAGER).force(),
                &Patch::Apply(deployment),
            )
            .await?;
        Ok(applied)
    }

    async fn get_secret(&self, key: &ObjectKey) -> OperatorResult<Option<Secret>> {
        get_optional(&self.namespaced::<Secret>(&key.namespace), &key.name).await
    }

    async fn get_loginset(&self, key: &ObjectKey) -> OperatorResult<Option<LoginSet>> {
        get_optional(&self.namespaced::<LoginSet>(&key.namespace), &key.name).await
    }

    async fn update_loginset_status(
        &self,
        key: &ObjectKey,
        status: &LoginSetStatus,
    ) -> OperatorResult<()> {
        patch_status(&self.namespaced::<LoginSet>(&key.namespace), &key.name, status).await
    }
}
