//! NodeSet controller.
//!
//! Reconciles NodeSet resources into ordinal-addressed slurmd pods, keeps
//! Slurm node state mirrored into pod conditions and NodeSet status, and
//! performs rolling updates that wait for Slurm jobs to drain.

pub mod node_eventhandler;
pub mod revision;
pub mod slurm_control;
pub mod slurm_eventhandler;
pub mod status;
mod sync;
pub mod utils;

use std::sync::Arc;
use std::time::Instant;

use kube::runtime::controller::Action;

use super::{ControllerContext, ReconcileAction};
use crate::crd::NodeSet;
use crate::durationstore::{DurationStore, MergePolicy};
use crate::error::{OperatorError, OperatorResult};
use crate::key::ObjectKey;
use slurm_control::SlurmControl;

pub use node_eventhandler::{NodeCache, NodeEventHandler, NodeWatchEvent, RequestQueue};
pub use slurm_eventhandler::nodesets_for_slurm_event;
pub use status::{calculate_replica_status, ReplicaStatus};

fn error_backoff_id(key: &ObjectKey) -> String {
    format!("nodeset:{}", key)
}

fn pod_backoff_id(pod: &ObjectKey) -> String {
    format!("pod:{}", pod)
}

/// Controller for NodeSet resources.
pub struct NodeSetController {
    ctx: Arc<ControllerContext>,
    slurm: SlurmControl,
    durations: DurationStore,
}

impl NodeSetController {
    /// Create a new NodeSet controller.
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self {
            slurm: SlurmControl::new(ctx.client_map.clone()),
            durations: DurationStore::new(MergePolicy::Greater),
            ctx,
        }
    }

    /// Reconcile a NodeSet.
    ///
    /// Requeue delays requested by individual sync steps are collected in
    /// the duration store and the largest one is returned.
    pub async fn reconcile(&self, nodeset: Arc<NodeSet>) -> OperatorResult<ReconcileAction> {
        let key = nodeset.key();
        let start = Instant::now();
        tracing::debug!(nodeset = %key, "Started syncing NodeSet");

        let result = self.sync(&key).await;
        let requeue = self.durations.pop(&key.to_string());

        tracing::debug!(
            nodeset = %key,
            duration = ?start.elapsed(),
            requeue = ?requeue,
            "Finished syncing NodeSet"
        );

        result?;
        self.ctx.backoff.reset(&error_backoff_id(&key));
        Ok(ReconcileAction::after(requeue))
    }
}

/// Error policy for the NodeSet controller.
pub fn error_policy(
    nodeset: Arc<NodeSet>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = nodeset.key();
    tracing::error!(nodeset = %key, error = %error, "NodeSet reconciliation error");
    ctx.error_requeue(&error_backoff_id(&key), error)
}


#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;
    use crate::testing::{self, FakeSlurm};

    #[tokio::test]
    async fn reconcile_missing_nodeset_is_done() {
        let h = harness(FakeSlurm::default());
        let nodeset = Arc::new(testing::new_nodeset("gone", "slurm", 1));
        let action = h.controller.reconcile(nodeset).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
    }

    #[tokio::test]
    async fn reconcile_returns_pushed_requeue() {
        let h = harness(FakeSlurm::default());
        let nodeset = testing::new_nodeset("foo", "slurm", 1);
        h.kube.add_nodeset(nodeset.clone());
        h.controller
            .durations
            .push(&nodeset.key().to_string(), std::time::Duration::from_secs(42));

        // A fresh NodeSet creates its pod and asks for nothing else.
        let action = h.controller.reconcile(Arc::new(nodeset)).await.unwrap();
        assert_eq!(
            action,
            ReconcileAction::Requeue(std::time::Duration::from_secs(42))
        );
        assert_eq!(h.kube.pod_names(), vec!["foo-0"]);
    }

    #[tokio::test]
    async fn error_policy_backs_off() {
        let h = harness(FakeSlurm::default());
        let mut nodeset = testing::new_nodeset("foo", "slurm", 1);
        nodeset.spec.replicas = Some(-1);
        h.kube.add_nodeset(nodeset.clone());

        let err = h
            .controller
            .reconcile(Arc::new(nodeset.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::ValidationError(_)));

        let action = error_policy(Arc::new(nodeset), &err, h.controller.ctx.clone());
        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(300)));
    }
}
