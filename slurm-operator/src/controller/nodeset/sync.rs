//! One NodeSet sync pass: revisions, scaling, failed pods, cordon drains,
//! rolling update, then status.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use slurm_client::Node as SlurmNode;

use super::revision::{self, Revisions};
use super::slurm_control;
use super::utils;
use super::{error_backoff_id, pod_backoff_id, NodeSetController};
use crate::clientmap::SlurmClientRef;
use crate::crd::{validation, NodeSet, PvcRetentionPolicyType, UpdateStrategyType};
use crate::error::{OperatorError, OperatorResult};
use crate::key::ObjectKey;

/// Requeue while waiting for Slurm jobs to leave a drained node.
const DRAIN_REQUEUE: Duration = Duration::from_secs(30);

/// Slurm nodes seen by one sync pass.
enum SlurmNodes {
    /// No client is registered for the Controller yet.
    Unavailable,
    /// Listing failed; steps that must not disrupt jobs are skipped.
    Unknown,
    /// Node records by name.
    Known(SlurmClientRef, HashMap<String, SlurmNode>),
}

impl SlurmNodes {
    fn node_for(&self, pod: &Pod) -> Option<(&SlurmClientRef, &SlurmNode)> {
        match self {
            SlurmNodes::Known(client, nodes) => nodes
                .get(&utils::slurm_node_name(pod))
                .map(|node| (client, node)),
            _ => None,
        }
    }

    /// `None` when busyness cannot be determined.
    fn is_busy(&self, pod: &Pod) -> Option<bool> {
        match self {
            SlurmNodes::Unavailable => Some(false),
            SlurmNodes::Unknown => None,
            SlurmNodes::Known(..) => Some(
                self.node_for(pod)
                    .is_some_and(|(_, node)| node.node_state().is_busy()),
            ),
        }
    }
}

impl NodeSetController {
    /// Converge one NodeSet.
    pub(super) async fn sync(&self, key: &ObjectKey) -> OperatorResult<()> {
        let Some(nodeset) = self.ctx.kube.get_nodeset(key).await? else {
            tracing::debug!(nodeset = %key, "NodeSet has been deleted");
            self.ctx.backoff.reset(&error_backoff_id(key));
            self.reset_pod_backoffs(key);
            return Ok(());
        };
        if nodeset.metadata.deletion_timestamp.is_some() {
            tracing::debug!(nodeset = %key, "NodeSet is being deleted");
            return Ok(());
        }

        validation::validate_nodeset(&nodeset.spec)?;

        let pods = self.list_owned_pods(&nodeset).await?;
        let history = revision::list_revisions(self.ctx.kube.as_ref(), &nodeset).await?;
        let revisions =
            revision::get_revisions(self.ctx.kube.as_ref(), &nodeset, &history, &pods).await?;

        let slurm_nodes = self.slurm_nodes(&nodeset).await;

        let mut errors = Vec::new();
        self.sync_replicas(&nodeset, &pods, &revisions, &slurm_nodes, &mut errors)
            .await;
        self.sync_failed_pods(&nodeset, &pods, &mut errors).await;
        self.sync_cordon(&nodeset, &pods, &revisions, &slurm_nodes, &mut errors)
            .await;
        if nodeset.update_strategy() == Some(UpdateStrategyType::RollingUpdate) {
            self.sync_rolling_update(&nodeset, &pods, &revisions, &slurm_nodes, &mut errors)
                .await;
        }

        let pods = self.list_owned_pods(&nodeset).await?;
        if let Err(e) = revision::truncate_history(
            self.ctx.kube.as_ref(),
            &nodeset,
            &history,
            &revisions,
            &pods,
        )
        .await
        {
            errors.push(e);
        }

        self.sync_status(&nodeset, &pods, &revisions, errors).await
    }

    /// Forget the failed-pod backoff of every ordinal of a deleted NodeSet.
    ///
    /// Pods of a NodeSet whose name merely extends this one (`foo` and
    /// `foo-bar`) are left alone.
    fn reset_pod_backoffs(&self, key: &ObjectKey) {
        let prefix = pod_backoff_id(&ObjectKey::new(&key.namespace, ""));
        self.ctx.backoff.reset_where(|id| {
            id.strip_prefix(prefix.as_str())
                .is_some_and(|pod| utils::parse_ordinal(&key.name, pod).is_some())
        });
    }

    /// Pods selected by the NodeSet and controlled by it, by ordinal.
    async fn list_owned_pods(&self, nodeset: &NodeSet) -> OperatorResult<Vec<Pod>> {
        let namespace = nodeset.namespace().unwrap_or_default();
        let mut pods: Vec<Pod> = self
            .ctx
            .kube
            .list_pods(&namespace, &nodeset.selector_labels())
            .await?
            .into_iter()
            .filter(|pod| utils::is_owned_by(pod, nodeset))
            .collect();
        utils::sort_by_ordinal(nodeset, &mut pods);
        Ok(pods)
    }

    async fn slurm_nodes(&self, nodeset: &NodeSet) -> SlurmNodes {
        let Some(client) = self.slurm.client_for(nodeset) else {
            return SlurmNodes::Unavailable;
        };
        match self.slurm.get_nodes(nodeset).await {
            Ok(Some(nodes)) => SlurmNodes::Known(client, nodes),
            Ok(None) => SlurmNodes::Unavailable,
            Err(e) => {
                tracing::warn!(nodeset = %nodeset.key(), error = %e, "Failed to list Slurm nodes");
                SlurmNodes::Unknown
            }
        }
    }

    fn request_requeue(&self, nodeset: &NodeSet, delay: Duration) {
        self.durations.push(&nodeset.key().to_string(), delay);
    }

    /// Create missing ordinals and remove condemned ones.
    async fn sync_replicas(
        &self,
        nodeset: &NodeSet,
        pods: &[Pod],
        revisions: &Revisions,
        slurm_nodes: &SlurmNodes,
        errors: &mut Vec<OperatorError>,
    ) {
        let replicas = nodeset.replicas();
        let existing: BTreeMap<i32, &Pod> = pods
            .iter()
            .filter_map(|pod| utils::pod_ordinal(nodeset, pod).map(|ordinal| (ordinal, pod)))
            .collect();

        for ordinal in (0..replicas).filter(|o| !existing.contains_key(o)) {
            if let Err(e) = self.create_pod(nodeset, ordinal, revisions.update_hash()).await {
                errors.push(e);
            }
        }

        let condemned = existing
            .iter()
            .rev()
            .filter(|(ordinal, _)| **ordinal >= replicas)
            .map(|(_, pod)| *pod);
        for pod in condemned {
            if utils::is_terminating(pod) {
                continue;
            }
            if let Err(e) = self.delete_condemned(nodeset, pod, slurm_nodes).await {
                errors.push(e);
            }
        }
    }

    async fn create_pod(&self, nodeset: &NodeSet, ordinal: i32, hash: &str) -> OperatorResult<()> {
        let pod_name = utils::pod_name(nodeset, ordinal);
        for pvc in utils::new_pvcs(nodeset, &pod_name) {
            self.ctx.kube.create_pvc(&pvc).await?;
        }
        let pod = utils::new_nodeset_pod(nodeset, ordinal, hash);
        self.ctx.kube.create_pod(&pod).await?;
        tracing::info!(nodeset = %nodeset.key(), pod = %pod_name, revision = %hash, "Created pod");
        Ok(())
    }

    async fn delete_condemned(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        slurm_nodes: &SlurmNodes,
    ) -> OperatorResult<()> {
        match slurm_nodes.is_busy(pod) {
            None => {
                self.request_requeue(nodeset, DRAIN_REQUEUE);
                return Ok(());
            }
            Some(true) => {
                if let Some((client, node)) = slurm_nodes.node_for(pod) {
                    let reason = slurm_control::delete_reason(&pod.name_any());
                    self.slurm.drain(client, node, &reason).await?;
                }
                self.request_requeue(nodeset, DRAIN_REQUEUE);
                return Ok(());
            }
            Some(false) => {}
        }

        let pod_key = utils::pod_key(pod);
        self.ctx.kube.delete_pod(&pod_key).await?;
        tracing::info!(nodeset = %nodeset.key(), pod = %pod_key, "Deleted condemned pod");

        if nodeset.when_scaled() == PvcRetentionPolicyType::Delete {
            for pvc in utils::new_pvcs(nodeset, &pod.name_any()) {
                self.ctx.kube.delete_pvc(&ObjectKey::of(&pvc)).await?;
            }
        }
        Ok(())
    }

    /// Delete failed pods so they are recreated, backing off per pod.
    async fn sync_failed_pods(
        &self,
        nodeset: &NodeSet,
        pods: &[Pod],
        errors: &mut Vec<OperatorError>,
    ) {
        let now = Instant::now();
        let failed = pods
            .iter()
            .filter(|pod| utils::is_failed(pod) && !utils::is_terminating(pod))
            .filter(|pod| {
                utils::pod_ordinal(nodeset, pod).is_some_and(|o| o < nodeset.replicas())
            });

        for pod in failed {
            let pod_key = utils::pod_key(pod);
            let id = pod_backoff_id(&pod_key);
            if self.ctx.backoff.is_in_backoff_since_update(&id, now) {
                tracing::debug!(pod = %pod_key, "Failed pod is in backoff");
                self.request_requeue(nodeset, self.ctx.backoff.get(&id));
                continue;
            }

            let delay = self.ctx.backoff.next(&id, now);
            tracing::info!(pod = %pod_key, backoff = ?delay, "Deleting failed pod");
            if let Err(e) = self.ctx.kube.delete_pod(&pod_key).await {
                errors.push(e);
            }
        }
    }

    /// Drain Slurm nodes on cordoned Kubernetes nodes and undrain them once
    /// the reason the operator drained them is gone.
    async fn sync_cordon(
        &self,
        nodeset: &NodeSet,
        pods: &[Pod],
        revisions: &Revisions,
        slurm_nodes: &SlurmNodes,
        errors: &mut Vec<OperatorError>,
    ) {
        let mut unschedulable: HashMap<String, bool> = HashMap::new();

        for pod in pods.iter().filter(|p| utils::is_running(p)) {
            let Some(node_name) = utils::node_name(pod) else {
                continue;
            };
            let Some((client, slurm_node)) = slurm_nodes.node_for(pod) else {
                continue;
            };

            let cordoned = match unschedulable.get(node_name) {
                Some(cordoned) => *cordoned,
                None => match self.ctx.kube.get_node(node_name).await {
                    Ok(node) => {
                        let cordoned = node
                            .and_then(|n| n.spec)
                            .and_then(|s| s.unschedulable)
                            .unwrap_or(false);
                        unschedulable.insert(node_name.to_string(), cordoned);
                        cordoned
                    }
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                },
            };

            let result = if cordoned {
                let reason = slurm_control::cordon_reason(node_name);
                self.slurm.drain(client, slurm_node, &reason).await
            } else if self.should_undrain(nodeset, pod, revisions) {
                self.slurm.undrain(client, slurm_node).await
            } else {
                Ok(())
            };
            if let Err(e) = result {
                errors.push(e);
            }
        }
    }

    fn should_undrain(&self, nodeset: &NodeSet, pod: &Pod, revisions: &Revisions) -> bool {
        let in_range = utils::pod_ordinal(nodeset, pod).is_some_and(|o| o < nodeset.replicas());
        let up_to_date = utils::revision_hash(pod) == revisions.update_hash();
        in_range && up_to_date && !utils::is_terminating(pod)
    }

    /// Replace pods of older revisions within the `maxUnavailable` budget.
    async fn sync_rolling_update(
        &self,
        nodeset: &NodeSet,
        pods: &[Pod],
        revisions: &Revisions,
        slurm_nodes: &SlurmNodes,
        errors: &mut Vec<OperatorError>,
    ) {
        let now = Utc::now();
        let replicas = nodeset.replicas();
        let min_ready = nodeset.spec.min_ready_seconds;
        let update_hash = revisions.update_hash();

        let active: Vec<&Pod> = pods
            .iter()
            .filter(|pod| utils::pod_ordinal(nodeset, pod).is_some_and(|o| o < replicas))
            .collect();
        let unavailable = active
            .iter()
            .filter(|pod| utils::is_terminating(pod) || !utils::is_available(pod, min_ready, now))
            .count() as i32;

        let stale: Vec<&Pod> = active
            .iter()
            .rev()
            .filter(|pod| utils::revision_hash(pod) != update_hash && !utils::is_terminating(pod))
            .copied()
            .collect();
        if stale.is_empty() {
            return;
        }

        let (stale_available, stale_unavailable): (Vec<&Pod>, Vec<&Pod>) = stale
            .into_iter()
            .partition(|pod| utils::is_available(pod, min_ready, now));

        // Replacing a pod that is already unavailable costs nothing.
        for pod in stale_unavailable {
            let pod_key = utils::pod_key(pod);
            tracing::info!(pod = %pod_key, "Deleting unavailable pod for update");
            if let Err(e) = self.ctx.kube.delete_pod(&pod_key).await {
                errors.push(e);
            }
        }

        let mut budget = nodeset.max_unavailable() - unavailable;
        for pod in stale_available {
            if budget <= 0 {
                break;
            }
            match slurm_nodes.is_busy(pod) {
                None => {
                    self.request_requeue(nodeset, DRAIN_REQUEUE);
                    continue;
                }
                Some(true) => {
                    if let Some((client, node)) = slurm_nodes.node_for(pod) {
                        let reason = slurm_control::update_reason(&pod.name_any());
                        if let Err(e) = self.slurm.drain(client, node, &reason).await {
                            errors.push(e);
                        }
                    }
                    self.request_requeue(nodeset, DRAIN_REQUEUE);
                    continue;
                }
                Some(false) => {}
            }

            let pod_key = utils::pod_key(pod);
            tracing::info!(
                pod = %pod_key,
                from = %utils::revision_hash(pod),
                to = %update_hash,
                "Deleting pod for update"
            );
            match self.ctx.kube.delete_pod(&pod_key).await {
                Ok(()) => budget -= 1,
                Err(e) => errors.push(e),
            }
        }
    }
}
