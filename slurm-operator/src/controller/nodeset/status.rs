//! NodeSet status: replica counters from pods, Slurm counters from node
//! records, and pod conditions mirroring Slurm node state.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use super::revision::{self, Revisions};
use super::slurm_control::{build_node_status, merge_pod_conditions, SlurmNodeStatus};
use super::utils;
use super::NodeSetController;
use crate::crd::{NodeSet, NodeSetStatus};
use crate::error::{OperatorError, OperatorResult};
use crate::key::ObjectKey;

/// Replica counters derived from a pod list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub replicas: i32,
    pub available: i32,
    pub ready: i32,
    pub current: i32,
    pub updated: i32,
    pub unavailable: i32,
}

/// Classify every pod against the readiness window and both revisions.
pub fn calculate_replica_status(
    nodeset: &NodeSet,
    pods: &[Pod],
    current: &ControllerRevision,
    update: &ControllerRevision,
    now: DateTime<Utc>,
) -> ReplicaStatus {
    let current_hash = revision::revision_hash(current);
    let update_hash = revision::revision_hash(update);
    let min_ready_seconds = nodeset.spec.min_ready_seconds;

    let mut status = ReplicaStatus {
        replicas: pods.len() as i32,
        ..Default::default()
    };
    for pod in pods {
        if utils::is_available(pod, min_ready_seconds, now) {
            status.available += 1;
        }
        if utils::is_ready(pod) {
            status.ready += 1;
        }
        let hash = utils::revision_hash(pod);
        if hash == current_hash {
            status.current += 1;
        }
        if hash == update_hash {
            status.updated += 1;
        }
    }
    status.unavailable = (status.replicas - status.available).max(0);
    status
}

impl NodeSetController {
    /// Refresh Slurm-derived pod conditions and NodeSet status.
    ///
    /// `errors` collected earlier in the pass are returned together with any
    /// status error, after the status write was attempted.
    pub(super) async fn sync_status(
        &self,
        nodeset: &NodeSet,
        pods: &[Pod],
        revisions: &Revisions,
        mut errors: Vec<OperatorError>,
    ) -> OperatorResult<()> {
        if let Err(e) = self
            .sync_nodeset_status(
                nodeset,
                pods,
                &revisions.current,
                &revisions.update,
                revisions.collision_count,
                revisions.update_hash(),
            )
            .await
        {
            errors.push(e);
        }
        OperatorError::from_errors(errors)
    }

    /// Compute the NodeSet status and write it when it changed.
    pub async fn sync_nodeset_status(
        &self,
        nodeset: &NodeSet,
        pods: &[Pod],
        current: &ControllerRevision,
        update: &ControllerRevision,
        collision_count: i32,
        hash: &str,
    ) -> OperatorResult<()> {
        let replicas = calculate_replica_status(nodeset, pods, current, update, Utc::now());
        let slurm = self.sync_slurm_status(nodeset, pods).await?;

        let new_status = NodeSetStatus {
            replicas: replicas.replicas,
            ready_replicas: replicas.ready,
            available_replicas: replicas.available,
            updated_replicas: replicas.updated,
            unavailable_replicas: replicas.unavailable,
            slurm_idle: slurm.idle,
            slurm_allocated: slurm.allocated,
            slurm_down: slurm.down,
            slurm_drain: slurm.drain,
            node_set_hash: hash.to_string(),
            collision_count: Some(collision_count),
            selector: nodeset.selector(),
            observed_generation: nodeset.metadata.generation,
        };

        if nodeset.status.clone().unwrap_or_default() == new_status {
            tracing::trace!(nodeset = %nodeset.key(), "NodeSet status unchanged");
            return Ok(());
        }
        self.update_nodeset_status(&nodeset.key(), &new_status).await
    }

    /// Read the Slurm nodes behind `pods` and mirror them into pod conditions.
    ///
    /// Without a registered client the Slurm counters are zero and pod
    /// conditions are left as they are.
    pub async fn sync_slurm_status(
        &self,
        nodeset: &NodeSet,
        pods: &[Pod],
    ) -> OperatorResult<SlurmNodeStatus> {
        let Some(nodes) = self.slurm.get_nodes(nodeset).await? else {
            return Ok(SlurmNodeStatus::default());
        };
        let status = build_node_status(pods, &nodes);
        self.update_nodeset_pod_conditions(pods, &status).await?;
        Ok(status)
    }

    /// Replace the Slurm conditions of each pod with those in `status`.
    ///
    /// Only pods whose conditions change are written.
    pub async fn update_nodeset_pod_conditions(
        &self,
        pods: &[Pod],
        status: &SlurmNodeStatus,
    ) -> OperatorResult<()> {
        let mut errors = Vec::new();
        for pod in pods {
            let desired = status
                .node_states
                .get(&pod.name_any())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let existing = pod
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_deref())
                .unwrap_or_default();

            let Some(conditions) = merge_pod_conditions(existing, desired) else {
                continue;
            };
            let mut updated = pod.clone();
            updated.status.get_or_insert_with(Default::default).conditions = Some(conditions);

            tracing::debug!(pod = %utils::pod_key(pod), "Updating pod Slurm conditions");
            if let Err(e) = self.ctx.kube.update_pod_status(&updated).await {
                errors.push(e);
            }
        }
        OperatorError::from_errors(errors)
    }

    /// Write status against the latest copy of the NodeSet.
    ///
    /// A NodeSet deleted in the meantime is not an error.
    pub async fn update_nodeset_status(
        &self,
        key: &ObjectKey,
        status: &NodeSetStatus,
    ) -> OperatorResult<()> {
        if self.ctx.kube.get_nodeset(key).await?.is_none() {
            tracing::debug!(nodeset = %key, "NodeSet deleted before status update");
            return Ok(());
        }
        self.ctx.kube.update_nodeset_status(key, status).await?;
        tracing::debug!(
            nodeset = %key,
            replicas = status.replicas,
            ready = status.ready_replicas,
            idle = status.slurm_idle,
            "Updated NodeSet status"
        );
        Ok(())
    }
}
