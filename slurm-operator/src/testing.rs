//! In-memory fakes and fixtures for controller tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{
    ControllerRevision, Deployment, DeploymentSpec, DeploymentStatus,
};
use k8s_openapi::api::core::v1::{
    Container, Node, NodeSpec, PersistentVolumeClaim, Pod, PodCondition, PodSpec, PodStatus,
    PodTemplateSpec, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use k8s_openapi::ByteString;
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};
use mockall::mock;
use parking_lot::Mutex;
use slurm_client::{ClientError, Node as SlurmNode, NodeUpdate, SlurmApi};

use crate::controller::nodeset::utils;
use crate::crd::{
    Controller, ControllerSpec, JwtSecretKeySelector, LoginSet, LoginSetSpec, LoginSetStatus,
    NodeSet, NodeSetSpec, NodeSetStatus, ObjectReference, RestApi, RestApiSpec, SecretKeyRef,
};
use crate::error::{OperatorError, OperatorResult};
use crate::key::ObjectKey;
use crate::labels;

pub const NAMESPACE: &str = "default";

pub const JWT_KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

fn api_error(code: u16, reason: &str, message: String) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    ObjectKey::of(obj)
}

/// Everything [`FakeKube`] stores.
#[derive(Default)]
pub struct FakeState {
    pub nodesets: BTreeMap<ObjectKey, NodeSet>,
    pub pods: BTreeMap<ObjectKey, Pod>,
    pub revisions: BTreeMap<ObjectKey, ControllerRevision>,
    pub pvcs: BTreeMap<ObjectKey, PersistentVolumeClaim>,
    pub nodes: BTreeMap<String, Node>,
    pub controllers: BTreeMap<ObjectKey, Controller>,
    pub restapis: BTreeMap<ObjectKey, RestApi>,
    pub deployments: BTreeMap<ObjectKey, Deployment>,
    pub secrets: BTreeMap<ObjectKey, Secret>,
    pub loginsets: BTreeMap<ObjectKey, LoginSet>,

    pub nodeset_status_writes: usize,
    pub pod_status_writes: usize,
    pub loginset_status_writes: usize,
    pub deleted_pods: Vec<String>,
    pub fail_nodeset_status_update: bool,
    /// NodeSets whose reads fail with a server error.
    pub fail_nodeset_get: BTreeSet<ObjectKey>,
}

/// [`KubeApi`](crate::kube_api::KubeApi) over in-memory maps.
#[derive(Default)]
pub struct FakeKube {
    state: Mutex<FakeState>,
}

impl FakeKube {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    pub fn add_nodeset(&self, nodeset: NodeSet) {
        self.state.lock().nodesets.insert(key_of(&nodeset), nodeset);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state.lock().pods.insert(key_of(&pod), pod);
    }

    pub fn add_revision(&self, revision: ControllerRevision) {
        self.state.lock().revisions.insert(key_of(&revision), revision);
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        self.state.lock().pvcs.insert(key_of(&pvc), pvc);
    }

    pub fn add_node(&self, node: Node) {
        self.state.lock().nodes.insert(node.name_any(), node);
    }

    pub fn add_controller(&self, controller: Controller) {
        self.state
            .lock()
            .controllers
            .insert(key_of(&controller), controller);
    }

    pub fn add_restapi(&self, restapi: RestApi) {
        self.state.lock().restapis.insert(key_of(&restapi), restapi);
    }

    pub fn add_deployment(&self, deployment: Deployment) {
        self.state
            .lock()
            .deployments
            .insert(key_of(&deployment), deployment);
    }

    pub fn add_secret(&self, secret: Secret) {
        self.state.lock().secrets.insert(key_of(&secret), secret);
    }

    pub fn add_loginset(&self, loginset: LoginSet) {
        self.state.lock().loginsets.insert(key_of(&loginset), loginset);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .pods
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state.lock().pods.values().map(|p| p.name_any()).collect()
    }

    pub fn nodeset_status(&self, key: &ObjectKey) -> Option<NodeSetStatus> {
        self.state
            .lock()
            .nodesets
            .get(key)
            .and_then(|n| n.status.clone())
    }
}

#[async_trait]
impl crate::kube_api::KubeApi for FakeKube {
    async fn get_nodeset(&self, key: &ObjectKey) -> OperatorResult<Option<NodeSet>> {
        let state = self.state.lock();
        if state.fail_nodeset_get.contains(key) {
            return Err(api_error(500, "InternalError", format!("nodeset {} unavailable", key)));
        }
        Ok(state.nodesets.get(key).cloned())
    }

    async fn update_nodeset_status(
        &self,
        key: &ObjectKey,
        status: &NodeSetStatus,
    ) -> OperatorResult<()> {
        let mut state = self.state.lock();
        if state.fail_nodeset_status_update {
            return Err(api_error(409, "Conflict", "status conflict".to_string()));
        }
        let Some(nodeset) = state.nodesets.get_mut(key) else {
            return Err(api_error(404, "NotFound", format!("nodeset {} not found", key)));
        };
        nodeset.status = Some(status.clone());
        state.nodeset_status_writes += 1;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> OperatorResult<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .pods
            .values()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| labels::matches(selector, p.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> OperatorResult<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .pods
            .values()
            .filter(|p| utils::node_name(p) == Some(node_name))
            .cloned()
            .collect())
    }

    async fn create_pod(&self, pod: &Pod) -> OperatorResult<Pod> {
        let mut state = self.state.lock();
        let key = key_of(pod);
        if state.pods.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("pod {} exists", key)));
        }
        let mut created = pod.clone();
        created.metadata.uid = Some(format!("uid-{}", pod.name_any()));
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        state.pods.insert(key, created.clone());
        Ok(created)
    }

    async fn delete_pod(&self, key: &ObjectKey) -> OperatorResult<()> {
        let mut state = self.state.lock();
        if state.pods.remove(key).is_some() {
            state.deleted_pods.push(key.name.clone());
        }
        Ok(())
    }

    async fn update_pod_status(&self, pod: &Pod) -> OperatorResult<()> {
        let mut state = self.state.lock();
        let key = key_of(pod);
        let Some(stored) = state.pods.get_mut(&key) else {
            return Err(api_error(404, "NotFound", format!("pod {} not found", key)));
        };
        let conditions = pod.status.as_ref().and_then(|s| s.conditions.clone());
        stored.status.get_or_insert_with(Default::default).conditions = conditions;
        state.pod_status_writes += 1;
        Ok(())
    }

    async fn list_revisions(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> OperatorResult<Vec<ControllerRevision>> {
        Ok(self
            .state
            .lock()
            .revisions
            .values()
            .filter(|r| r.namespace().as_deref() == Some(namespace))
            .filter(|r| labels::matches(selector, r.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn create_revision(
        &self,
        revision: &ControllerRevision,
    ) -> OperatorResult<ControllerRevision> {
        let mut state = self.state.lock();
        let key = key_of(revision);
        if state.revisions.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("revision {} exists", key)));
        }
        state.revisions.insert(key, revision.clone());
        Ok(revision.clone())
    }

    async fn delete_revision(&self, key: &ObjectKey) -> OperatorResult<()> {
        self.state.lock().revisions.remove(key);
        Ok(())
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> OperatorResult<()> {
        self.state
            .lock()
            .pvcs
            .entry(key_of(pvc))
            .or_insert_with(|| pvc.clone());
        Ok(())
    }

    async fn delete_pvc(&self, key: &ObjectKey) -> OperatorResult<()> {
        self.state.lock().pvcs.remove(key);
        Ok(())
    }

    async fn get_node(&self, name: &str) -> OperatorResult<Option<Node>> {
        Ok(self.state.lock().nodes.get(name).cloned())
    }

    async fn get_controller(&self, key: &ObjectKey) -> OperatorResult<Option<Controller>> {
        Ok(self.state.lock().controllers.get(key).cloned())
    }

    async fn list_restapis(&self, namespace: &str) -> OperatorResult<Vec<RestApi>> {
        Ok(self
            .state
            .lock()
            .restapis
            .values()
            .filter(|r| r.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn get_deployment(&self, key: &ObjectKey) -> OperatorResult<Option<Deployment>> {
        Ok(self.state.lock().deployments.get(key).cloned())
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> OperatorResult<Deployment> {
        let mut state = self.state.lock();
        let key = key_of(deployment);
        let mut applied = deployment.clone();
        applied.status = state.deployments.get(&key).and_then(|d| d.status.clone());
        state.deployments.insert(key, applied.clone());
        Ok(applied)
    }

    async fn get_secret(&self, key: &ObjectKey) -> OperatorResult<Option<Secret>> {
        Ok(self.state.lock().secrets.get(key).cloned())
    }

    async fn get_loginset(&self, key: &ObjectKey) -> OperatorResult<Option<LoginSet>> {
        Ok(self.state.lock().loginsets.get(key).cloned())
    }

    async fn update_loginset_status(
        &self,
        key: &ObjectKey,
        status: &LoginSetStatus,
    ) -> OperatorResult<()> {
        let mut state = self.state.lock();
        let Some(loginset) = state.loginsets.get_mut(key) else {
            return Err(api_error(404, "NotFound", format!("loginset {} not found", key)));
        };
        loginset.status = Some(status.clone());
        state.loginset_status_writes += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSlurmState {
    pub server: String,
    pub token: String,
    pub nodes: BTreeMap<String, SlurmNode>,
    pub updates: Vec<(String, NodeUpdate)>,
}

/// [`SlurmApi`] over an in-memory node table.
#[derive(Default)]
pub struct FakeSlurm {
    state: Mutex<FakeSlurmState>,
}

impl FakeSlurm {
    pub fn with_server(server: &str) -> Self {
        let fake = Self::default();
        fake.state.lock().server = server.to_string();
        fake
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = SlurmNode>) -> Self {
        let fake = Self::default();
        fake.state.lock().nodes = nodes.into_iter().map(|n| (n.name.clone(), n)).collect();
        fake
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, FakeSlurmState> {
        self.state.lock()
    }

    pub fn node(&self, name: &str) -> Option<SlurmNode> {
        self.state.lock().nodes.get(name).cloned()
    }
}

#[async_trait]
impl SlurmApi for FakeSlurm {
    fn server(&self) -> String {
        self.state.lock().server.clone()
    }

    fn set_server(&self, server: String) -> slurm_client::Result<()> {
        if !server.starts_with("http://") && !server.starts_with("https://") {
            return Err(ClientError::InvalidUrl(server));
        }
        self.state.lock().server = server;
        Ok(())
    }

    fn set_token(&self, token: String) {
        self.state.lock().token = token;
    }

    async fn list_nodes(&self) -> slurm_client::Result<Vec<SlurmNode>> {
        Ok(self.state.lock().nodes.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> slurm_client::Result<SlurmNode> {
        self.state
            .lock()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::NotFound {
                kind: "node",
                name: name.to_string(),
            })
    }

    async fn update_node(&self, name: &str, update: &NodeUpdate) -> slurm_client::Result<()> {
        let mut state = self.state.lock();
        state.updates.push((name.to_string(), update.clone()));
        let Some(node) = state.nodes.get_mut(name) else {
            return Err(ClientError::NotFound {
                kind: "node",
                name: name.to_string(),
            });
        };
        if update.state.iter().any(|s| s == "DRAIN") {
            if !node.state.iter().any(|s| s == "DRAIN") {
                node.state.push("DRAIN".to_string());
            }
            node.reason = update.reason.clone();
        }
        if update.state.iter().any(|s| s == "UNDRAIN") {
            node.state.retain(|s| s != "DRAIN");
            node.reason = None;
        }
        Ok(())
    }

    async fn ping(&self) -> slurm_client::Result<()> {
        Ok(())
    }
}

mock! {
    pub Slurm {}

    #[async_trait]
    impl SlurmApi for Slurm {
        fn server(&self) -> String;
        fn set_server(&self, server: String) -> slurm_client::Result<()>;
        fn set_token(&self, token: String);
        async fn list_nodes(&self) -> slurm_client::Result<Vec<SlurmNode>>;
        async fn get_node(&self, name: &str) -> slurm_client::Result<SlurmNode>;
        async fn update_node(&self, name: &str, update: &NodeUpdate) -> slurm_client::Result<()>;
        async fn ping(&self) -> slurm_client::Result<()>;
    }
}

pub fn new_controller(name: &str) -> Controller {
    let mut controller = Controller::new(
        name,
        ControllerSpec {
            cluster_name: String::new(),
            jwt_hs256_key_ref: JwtSecretKeySelector {
                name: format!("{}-jwt-key", name),
                key: "jwt_hs256.key".to_string(),
                namespace: None,
            },
        },
    );
    controller.metadata.namespace = Some(NAMESPACE.to_string());
    controller.metadata.uid = Some(format!("uid-{}", name));
    controller
}

pub fn new_jwt_secret(controller: &Controller) -> Secret {
    let selector = controller.jwt_hs256_ref();
    Secret {
        metadata: ObjectMeta {
            name: Some(selector.name.clone()),
            namespace: selector.namespace.clone(),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            selector.key,
            ByteString(JWT_KEY.to_vec()),
        )])),
        ..Default::default()
    }
}

pub fn new_restapi(name: &str, controller: &str) -> RestApi {
    let mut restapi = RestApi::new(
        name,
        RestApiSpec {
            controller_ref: ObjectReference {
                namespace: None,
                name: controller.to_string(),
            },
            replicas: 1,
        },
    );
    restapi.metadata.namespace = Some(NAMESPACE.to_string());
    restapi
}

pub fn new_deployment(name: &str, ready_replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec::default()),
        status: Some(DeploymentStatus {
            replicas: Some(1),
            ready_replicas: Some(ready_replicas),
            ..Default::default()
        }),
    }
}

fn slurmd_template() -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/component".to_string(),
                "worker".to_string(),
            )])),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "slurmd".to_string(),
                image: Some("ghcr.io/slinkyproject/slurmd:25.05".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

pub fn new_nodeset(name: &str, controller: &str, replicas: i32) -> NodeSet {
    let mut nodeset = NodeSet::new(
        name,
        NodeSetSpec {
            controller_ref: ObjectReference {
                namespace: None,
                name: controller.to_string(),
            },
            replicas: Some(replicas),
            template: slurmd_template(),
            update_strategy: Default::default(),
            persistent_volume_claim_retention_policy: Default::default(),
            volume_claim_templates: vec![],
            min_ready_seconds: 0,
            revision_history_limit: 10,
        },
    );
    nodeset.metadata.namespace = Some(NAMESPACE.to_string());
    nodeset.metadata.uid = Some(format!("uid-{}", name));
    nodeset
}

pub fn new_nodeset_pod(nodeset: &NodeSet, ordinal: i32, hash: &str) -> Pod {
    let mut pod = utils::new_nodeset_pod(nodeset, ordinal, hash);
    pod.metadata.uid = Some(format!("uid-{}", pod.name_any()));
    pod
}

pub fn make_pod_healthy(mut pod: Pod) -> Pod {
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            last_transition_time: Some(Time(Utc::now() - chrono::Duration::hours(1))),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

pub fn make_pod_created(mut pod: Pod) -> Pod {
    pod.status = Some(PodStatus {
        phase: Some("Pending".to_string()),
        ..Default::default()
    });
    pod
}

pub fn make_pod_failed(mut pod: Pod) -> Pod {
    pod.status = Some(PodStatus {
        phase: Some("Failed".to_string()),
        ..Default::default()
    });
    pod
}

pub fn schedule_on(mut pod: Pod, node: &str) -> Pod {
    pod.spec.get_or_insert_with(Default::default).node_name = Some(node.to_string());
    pod
}

pub fn new_slurm_node_for_pod(pod: &Pod) -> SlurmNode {
    SlurmNode::new(utils::slurm_node_name(pod), &["IDLE"])
}

pub fn new_revision(nodeset: &NodeSet, hash: &str, revision: i64) -> ControllerRevision {
    let mut revision_labels = nodeset.selector_labels();
    revision_labels.insert(labels::REVISION_HASH.to_string(), hash.to_string());
    ControllerRevision {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", nodeset.name_any(), hash)),
            namespace: nodeset.namespace(),
            labels: Some(revision_labels),
            owner_references: nodeset.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(RawExtension(serde_json::json!({
            "spec": { "template": nodeset.spec.template }
        }))),
        revision,
    }
}

pub fn new_node(name: &str, unschedulable: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable: Some(unschedulable),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn new_loginset(name: &str, controller: &str) -> LoginSet {
    let mut loginset = LoginSet::new(
        name,
        LoginSetSpec {
            controller_ref: ObjectReference {
                namespace: None,
                name: controller.to_string(),
            },
            replicas: 1,
            template: PodTemplateSpec::default(),
            sssd_conf_ref: SecretKeyRef {
                name: format!("{}-sssd", name),
                key: "sssd.conf".to_string(),
            },
        },
    );
    loginset.metadata.namespace = Some(NAMESPACE.to_string());
    loginset.metadata.uid = Some(format!("uid-{}", name));
    loginset
}

pub fn new_sssd_secret(loginset: &LoginSet, contents: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(loginset.spec.sssd_conf_ref.name.clone()),
            namespace: loginset.namespace(),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            loginset.spec.sssd_conf_ref.key.clone(),
            ByteString(contents.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Slurm nodes for every pod, keyed by name, all idle.
pub fn idle_nodes_for(pods: &[Pod]) -> HashMap<String, SlurmNode> {
    pods.iter()
        .map(new_slurm_node_for_pod)
        .map(|n| (n.name.clone(), n))
        .collect()
}
