//! Kubernetes Node events to NodeSet reconcile requests.
//!
//! A cordon or uncordon changes how the NodeSet controller treats the Slurm
//! nodes of pods on that Kubernetes node, so every NodeSet with a pod there
//! is requeued.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use tokio::sync::mpsc;

use crate::crd::{self, NodeSet};
use crate::error::OperatorResult;
use crate::key::ObjectKey;
use crate::kube_api::KubeApi;

/// Sink for reconcile requests.
pub trait RequestQueue: Send + Sync {
    /// Request a reconcile of `key`.
    fn enqueue(&self, key: ObjectKey);
}

impl<K> RequestQueue for mpsc::UnboundedSender<ObjectRef<K>>
where
    K: Resource<DynamicType = ()> + Send + Sync,
{
    fn enqueue(&self, key: ObjectKey) {
        if self.send(key.object_ref()).is_err() {
            tracing::debug!(key = %key, "Request queue closed");
        }
    }
}

/// A Node change as seen by the handler.
#[derive(Debug, Clone)]
pub enum NodeWatchEvent {
    Created(Node),
    Updated { old: Node, new: Node },
    Deleted(Node),
}

/// Last seen copy of each Node, to turn watch events into old/new pairs.
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: BTreeMap<String, Node>,
}

impl NodeCache {
    /// Record a watch event and translate it.
    ///
    /// Resync markers yield nothing.
    pub fn observe(&mut self, event: watcher::Event<Node>) -> Option<NodeWatchEvent> {
        match event {
            watcher::Event::Apply(node) | watcher::Event::InitApply(node) => {
                match self.nodes.insert(node.name_any(), node.clone()) {
                    Some(old) => Some(NodeWatchEvent::Updated { old, new: node }),
                    None => Some(NodeWatchEvent::Created(node)),
                }
            }
            watcher::Event::Delete(node) => {
                self.nodes.remove(&node.name_any());
                Some(NodeWatchEvent::Deleted(node))
            }
            watcher::Event::Init | watcher::Event::InitDone => None,
        }
    }
}

fn unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Translates Node updates into NodeSet requests.
pub struct NodeEventHandler {
    kube: Arc<dyn KubeApi>,
}

impl NodeEventHandler {
    pub fn new(kube: Arc<dyn KubeApi>) -> Self {
        Self { kube }
    }

    /// Enqueue every NodeSet with a pod on the node when its cordon state or
    /// annotations changed. Create and delete events are ignored.
    pub async fn handle(&self, event: &NodeWatchEvent, queue: &dyn RequestQueue) -> OperatorResult<()> {
        let NodeWatchEvent::Updated { old, new } = event else {
            return Ok(());
        };
        if unschedulable(old) == unschedulable(new) && old.annotations() == new.annotations() {
            return Ok(());
        }

        let node_name = new.name_any();
        tracing::debug!(
            node = %node_name,
            unschedulable = unschedulable(new),
            "Node changed, looking up NodeSets"
        );

        let mut nodesets = BTreeSet::new();
        for pod in self.kube.list_pods_on_node(&node_name).await? {
            match self.resolve_owner(&pod).await {
                Ok(Some(key)) => {
                    nodesets.insert(key);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    node = %node_name,
                    pod = %pod.name_any(),
                    error = %e,
                    "Failed to resolve NodeSet of pod"
                ),
            }
        }
        for key in nodesets {
            queue.enqueue(key);
        }
        Ok(())
    }

    /// The NodeSet controlling `pod`, verified by UID.
    async fn resolve_owner(&self, pod: &Pod) -> OperatorResult<Option<ObjectKey>> {
        let Some(owner) = pod.owner_references().iter().find(|r| r.controller == Some(true)) else {
            return Ok(None);
        };
        if owner.kind != "NodeSet" || owner.api_version != crd::API_VERSION {
            return Ok(None);
        }

        let key = ObjectKey::new(&pod.namespace().unwrap_or_default(), &owner.name);
        let Some(nodeset) = self.kube.get_nodeset(&key).await? else {
            return Ok(None);
        };
        if nodeset.uid().as_deref() != Some(owner.uid.as_str()) {
            return Ok(None);
        }
        Ok(Some(key))
    }
}

/// Queue for the NodeSet controller's node trigger.
pub type NodeSetQueue = mpsc::UnboundedSender<ObjectRef<NodeSet>>;
