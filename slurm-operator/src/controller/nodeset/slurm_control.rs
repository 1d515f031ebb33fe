//! Slurm side of a NodeSet: node states mirrored as pod conditions, and
//! drain/undrain of the nodes backing NodeSet pods.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use slurm_client::{Node as SlurmNode, NodeBaseState, NodeStateFlag, NodeUpdate};

use super::utils;
use crate::clientmap::{ClientMap, SlurmClientRef};
use crate::crd::NodeSet;
use crate::error::OperatorResult;

/// Prefix of every pod condition owned by this module.
pub const STATE_PREFIX: &str = "SlurmNodeState";

/// Node is idle.
pub const POD_CONDITION_IDLE: &str = "SlurmNodeStateIdle";
/// Node is fully allocated.
pub const POD_CONDITION_ALLOCATED: &str = "SlurmNodeStateAllocated";
/// Node is partially allocated.
pub const POD_CONDITION_MIXED: &str = "SlurmNodeStateMixed";
/// Node is down.
pub const POD_CONDITION_DOWN: &str = "SlurmNodeStateDown";
/// Node is in an error state.
pub const POD_CONDITION_ERROR: &str = "SlurmNodeStateError";
/// Node state is unknown.
pub const POD_CONDITION_UNKNOWN: &str = "SlurmNodeStateUnknown";
/// Node is draining or drained.
pub const POD_CONDITION_DRAIN: &str = "SlurmNodeStateDrain";
/// Jobs are completing on the node.
pub const POD_CONDITION_COMPLETING: &str = "SlurmNodeStateCompleting";
/// Node is failing.
pub const POD_CONDITION_FAIL: &str = "SlurmNodeStateFail";
/// Node is not responding.
pub const POD_CONDITION_NOT_RESPONDING: &str = "SlurmNodeStateNotResponding";

/// Reason the operator sets when a Kubernetes node is cordoned.
pub fn cordon_reason(node_name: &str) -> String {
    format!("Node ({}) was cordoned", node_name)
}

/// Reason the operator sets before replacing a busy pod.
pub fn update_reason(pod_name: &str) -> String {
    format!("Pod ({}) is pending update", pod_name)
}

/// Reason the operator sets before removing a busy pod on scale-in.
pub fn delete_reason(pod_name: &str) -> String {
    format!("Pod ({}) is pending deletion", pod_name)
}

/// Whether a drain reason was set by the operator.
pub fn is_operator_reason(reason: &str) -> bool {
    (reason.starts_with("Node (") && reason.ends_with(") was cordoned"))
        || (reason.starts_with("Pod (")
            && (reason.ends_with(") is pending update") || reason.ends_with(") is pending deletion")))
}

/// Slurm view of a NodeSet's pods, built once per sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlurmNodeStatus {
    /// Pod name to the conditions its Slurm node state implies.
    pub node_states: BTreeMap<String, Vec<PodCondition>>,
    /// Nodes that are idle.
    pub idle: i32,
    /// Nodes that are allocated or mixed.
    pub allocated: i32,
    /// Nodes that are down.
    pub down: i32,
    /// Nodes that are drained or draining.
    pub drain: i32,
}

fn condition(type_: &str, message: &str) -> PodCondition {
    PodCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        message: (!message.is_empty()).then(|| message.to_string()),
        last_transition_time: Some(Time(Utc::now())),
        ..Default::default()
    }
}

/// Pod conditions implied by a Slurm node record.
pub fn node_conditions(node: &SlurmNode) -> Vec<PodCondition> {
    let state = node.node_state();
    let reason = node.reason.as_deref().unwrap_or_default();

    let mut conditions = vec![match state.base {
        NodeBaseState::Idle => condition(POD_CONDITION_IDLE, ""),
        NodeBaseState::Allocated => condition(POD_CONDITION_ALLOCATED, ""),
        NodeBaseState::Mixed => condition(POD_CONDITION_MIXED, ""),
        NodeBaseState::Down => condition(POD_CONDITION_DOWN, reason),
        NodeBaseState::Error => condition(POD_CONDITION_ERROR, reason),
        NodeBaseState::Future | NodeBaseState::Unknown => condition(POD_CONDITION_UNKNOWN, ""),
    }];

    for flag in &state.flags {
        let extra = match flag {
            NodeStateFlag::Drain => condition(POD_CONDITION_DRAIN, reason),
            NodeStateFlag::Completing => condition(POD_CONDITION_COMPLETING, ""),
            NodeStateFlag::Fail => condition(POD_CONDITION_FAIL, reason),
            NodeStateFlag::NotResponding => condition(POD_CONDITION_NOT_RESPONDING, ""),
            _ => continue,
        };
        conditions.push(extra);
    }

    conditions
}

/// Map running pods to their Slurm nodes and tally node states.
///
/// Pods that are not running, or whose node Slurm does not report, get no
/// entry.
pub fn build_node_status(pods: &[Pod], nodes: &HashMap<String, SlurmNode>) -> SlurmNodeStatus {
    let mut status = SlurmNodeStatus::default();

    for pod in pods.iter().filter(|p| utils::is_running(p)) {
        let Some(node) = nodes.get(&utils::slurm_node_name(pod)) else {
            continue;
        };
        let state = node.node_state();
        match state.base {
            NodeBaseState::Idle => status.idle += 1,
            NodeBaseState::Allocated | NodeBaseState::Mixed => status.allocated += 1,
            NodeBaseState::Down => status.down += 1,
            _ => {}
        }
        if state.has_flag(&NodeStateFlag::Drain) {
            status.drain += 1;
        }
        status
            .node_states
            .insert(pod.name_any(), node_conditions(node));
    }

    status
}

/// Merge desired Slurm conditions into a pod's conditions.
///
/// Conditions without [`STATE_PREFIX`] are kept. A prefixed condition is kept
/// untouched when the desired set has the same type and message, otherwise
/// removed. Desired conditions not yet present are appended. Returns `None`
/// when nothing changes.
pub fn merge_pod_conditions(
    existing: &[PodCondition],
    desired: &[PodCondition],
) -> Option<Vec<PodCondition>> {
    let same = |a: &PodCondition, b: &PodCondition| a.type_ == b.type_ && a.message == b.message;

    let mut merged: Vec<PodCondition> = existing
        .iter()
        .filter(|c| !c.type_.starts_with(STATE_PREFIX) || desired.iter().any(|d| same(c, d)))
        .cloned()
        .collect();
    let removed = merged.len() != existing.len();

    let mut added = false;
    for d in desired {
        if !merged.iter().any(|c| same(c, d)) {
            merged.push(d.clone());
            added = true;
        }
    }

    (removed || added).then_some(merged)
}

/// Slurm operations for NodeSets, resolved through the [`ClientMap`].
#[derive(Clone)]
pub struct SlurmControl {
    client_map: std::sync::Arc<ClientMap>,
}

impl SlurmControl {
    /// Create over a client map.
    pub fn new(client_map: std::sync::Arc<ClientMap>) -> Self {
        Self { client_map }
    }

    /// Client of the NodeSet's Controller, if one is registered.
    pub fn client_for(&self, nodeset: &NodeSet) -> Option<SlurmClientRef> {
        self.client_map.get(&nodeset.controller_key())
    }

    /// All Slurm nodes of the NodeSet's cluster keyed by name, or `None`
    /// when no client is registered yet.
    pub async fn get_nodes(
        &self,
        nodeset: &NodeSet,
    ) -> OperatorResult<Option<HashMap<String, SlurmNode>>> {
        let Some(client) = self.client_for(nodeset) else {
            tracing::debug!(nodeset = %nodeset.key(), "No Slurm client for NodeSet controller");
            return Ok(None);
        };
        let nodes = client.list_nodes().await?;
        Ok(Some(
            nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
        ))
    }

    /// Drain a node unless it already is.
    pub async fn drain(
        &self,
        client: &SlurmClientRef,
        node: &SlurmNode,
        reason: &str,
    ) -> OperatorResult<()> {
        if node.node_state().has_flag(&NodeStateFlag::Drain) {
            return Ok(());
        }
        tracing::info!(node = %node.name, reason = %reason, "Draining Slurm node");
        client
            .update_node(&node.name, &NodeUpdate::drain(reason))
            .await?;
        Ok(())
    }

    /// Undrain a node the operator drained.
    pub async fn undrain(&self, client: &SlurmClientRef, node: &SlurmNode) -> OperatorResult<()> {
        let reason = node.reason.as_deref().unwrap_or_default();
        if !node.node_state().has_flag(&NodeStateFlag::Drain) || !is_operator_reason(reason) {
            return Ok(());
        }
        tracing::info!(node = %node.name, reason = %reason, "Undraining Slurm node");
        client.update_node(&node.name, &NodeUpdate::undrain()).await?;
        Ok(())
    }
}
