//! Kubernetes controllers for Slurm resources.
//!
//! - [`NodeSetController`]: slurmd pods, revisions and Slurm node state
//! - [`SlurmClientController`]: one Slurm REST client per Controller
//! - [`LoginSetController`]: login Deployments
//!
//! Each controller exposes `reconcile` and an `error_policy` for
//! `kube::runtime::Controller::run`:
//!
//! ```ignore
//! use slurm_operator::controller::{nodeset_error_policy, NodeSetController};
//!
//! let nodesets = Arc::new(NodeSetController::new(ctx.clone()));
//! Controller::new(api, watcher_config)
//!     .run(
//!         move |nodeset, _ctx| {
//!             let nodesets = nodesets.clone();
//!             async move { nodesets.reconcile(nodeset).await.map(Action::from) }
//!         },
//!         nodeset_error_policy,
//!         ctx,
//!     )
//! ```

pub mod loginset;
pub mod nodeset;
pub mod slurmclient;

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use slurm_client::NodeEvent;

use crate::backoff::Backoff;
use crate::clientmap::ClientMap;
use crate::error::OperatorError;
use crate::key::ObjectKey;
use crate::kube_api::KubeApi;

pub use loginset::{LoginSetController, error_policy as loginset_error_policy};
pub use nodeset::{NodeSetController, error_policy as nodeset_error_policy};
pub use slurmclient::{
    RestClientFactory, SlurmClientController, SlurmClientFactory,
    error_policy as slurmclient_error_policy,
};

/// Shared context for controllers.
///
/// One instance per process; every controller gets a clone of the `Arc`.
pub struct ControllerContext {
    /// Kubernetes access.
    pub kube: Arc<dyn KubeApi>,
    /// Slurm clients keyed by Controller.
    pub client_map: Arc<ClientMap>,
    /// Error and failed-pod backoff.
    pub backoff: Arc<Backoff>,
    /// Replaces the slurmrestd URL derived from the RestApi, for running
    /// the operator outside the cluster.
    pub restapi_server_override: Option<String>,
}

impl ControllerContext {
    /// Create a new controller context.
    pub fn new(kube: Arc<dyn KubeApi>, client_map: Arc<ClientMap>, backoff: Arc<Backoff>) -> Self {
        Self {
            kube,
            client_map,
            backoff,
            restapi_server_override: None,
        }
    }

    /// Set the slurmrestd URL override.
    pub fn with_restapi_server_override(mut self, server: Option<String>) -> Self {
        self.restapi_server_override = server.filter(|s| !s.is_empty());
        self
    }

    /// Requeue delay after a failed reconcile of `id`.
    ///
    /// Validation errors wait for the user to change the object; everything
    /// else backs off exponentially per object.
    pub fn error_requeue(&self, id: &str, error: &OperatorError) -> Action {
        if matches!(error, OperatorError::ValidationError(_)) {
            return Action::requeue(Duration::from_secs(300));
        }
        Action::requeue(self.backoff.next(id, Instant::now()))
    }
}

/// Result type for reconciliation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Requeue after the specified duration.
    Requeue(Duration),
    /// Don't requeue (reconciliation complete).
    Done,
}

impl ReconcileAction {
    /// Requeue after `delay`, or not at all when it is zero.
    pub fn after(delay: Duration) -> Self {
        if delay.is_zero() {
            Self::Done
        } else {
            Self::Requeue(delay)
        }
    }
}

impl From<ReconcileAction> for Action {
    fn from(action: ReconcileAction) -> Self {
        match action {
            ReconcileAction::Requeue(delay) => Action::requeue(delay),
            ReconcileAction::Done => Action::await_change(),
        }
    }
}

/// A Slurm node change attributed to the Controller whose client saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct SlurmNodeEvent {
    /// Controller the reporting client belongs to.
    pub controller: ObjectKey,
    /// What changed.
    pub event: NodeEvent,
}
