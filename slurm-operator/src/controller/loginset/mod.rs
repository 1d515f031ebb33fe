//! LoginSet controller.
//!
//! Runs the login pods of a cluster as a Deployment and mirrors the
//! Deployment's replica counts into the LoginSet status.

pub mod builder;
mod eventhandler;

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;

use super::{ControllerContext, ReconcileAction};
use crate::crd::validation::validate_loginset;
use crate::crd::{LoginSet, LoginSetStatus};
use crate::durationstore::{DurationStore, MergePolicy};
use crate::error::{OperatorError, OperatorResult};
use crate::key::ObjectKey;
use crate::labels;

pub use eventhandler::{loginsets_for_controller, loginsets_for_secret};

fn error_backoff_id(key: &ObjectKey) -> String {
    format!("loginset:{}", key)
}

/// Controller for LoginSet resources.
pub struct LoginSetController {
    ctx: Arc<ControllerContext>,
    durations: DurationStore,
}

impl LoginSetController {
    /// Create a new LoginSet controller.
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self {
            ctx,
            durations: DurationStore::new(MergePolicy::Greater),
        }
    }

    /// Reconcile a LoginSet.
    pub async fn reconcile(&self, loginset: Arc<LoginSet>) -> OperatorResult<ReconcileAction> {
        let key = loginset.key();
        let start = Instant::now();
        tracing::debug!(loginset = %key, "Started syncing LoginSet");

        let result = self.sync(&key).await;
        let requeue = self.durations.pop(&key.to_string());

        tracing::debug!(
            loginset = %key,
            duration = ?start.elapsed(),
            requeue = ?requeue,
            "Finished syncing LoginSet"
        );

        result?;
        self.ctx.backoff.reset(&error_backoff_id(&key));
        Ok(ReconcileAction::after(requeue))
    }

    async fn sync(&self, key: &ObjectKey) -> OperatorResult<()> {
        let Some(loginset) = self.ctx.kube.get_loginset(key).await? else {
            tracing::debug!(loginset = %key, "LoginSet has been deleted");
            return Ok(());
        };
        if loginset.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }
        validate_loginset(&loginset.spec)?;

        let controller_key = loginset.controller_key();
        let controller = self
            .ctx
            .kube
            .get_controller(&controller_key)
            .await?
            .ok_or_else(|| {
                OperatorError::not_found("Controller", &controller_key.namespace, &controller_key.name)
            })?;

        let sssd_conf = self.required_secret(&loginset.sssd_conf_key()).await?;
        let jwt_key = self.required_secret(&controller.jwt_hs256_key()).await?;

        let deployment = builder::build_deployment(&loginset, &sssd_conf, &jwt_key);
        let applied = self.ctx.kube.apply_deployment(&deployment).await?;
        tracing::debug!(loginset = %key, "Applied login Deployment");

        let deployment_status = applied.status.unwrap_or_default();
        let status = LoginSetStatus {
            replicas: deployment_status.replicas.unwrap_or(0),
            ready_replicas: deployment_status.ready_replicas.unwrap_or(0),
            selector: labels::selector_string(&loginset.selector_labels()),
        };
        if loginset.status.unwrap_or_default() == status {
            return Ok(());
        }

        match self.ctx.kube.update_loginset_status(key, &status).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!(loginset = %key, "LoginSet deleted before status update");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn required_secret(&self, key: &ObjectKey) -> OperatorResult<Secret> {
        self.ctx
            .kube
            .get_secret(key)
            .await?
            .ok_or_else(|| OperatorError::not_found("Secret", &key.namespace, &key.name))
    }
}

/// Error policy for the LoginSet controller.
pub fn error_policy(
    loginset: Arc<LoginSet>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = loginset.key();
    tracing::error!(loginset = %key, error = %error, "LoginSet reconciliation error");
    ctx.error_requeue(&error_backoff_id(&key), error)
}
