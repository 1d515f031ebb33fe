//! SlurmClient controller.
//!
//! Keeps one Slurm REST client per Controller resource in the shared
//! [`ClientMap`](crate::clientmap::ClientMap), pointed at the Controller's
//! slurmrestd and carrying a fresh JWT. Each client gets a node informer
//! whose events feed the NodeSet controller.

mod eventhandler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use kube::ResourceExt;
use parking_lot::Mutex;
use slurm_client::{Capability, ClientOptions, Config, InformerHandle, NodeInformer};
use tokio::sync::mpsc;

use super::{ControllerContext, ReconcileAction, SlurmNodeEvent};
use crate::clientmap::SlurmClientRef;
use crate::crd::{Controller, RestApi};
use crate::durationstore::{DurationStore, MergePolicy};
use crate::error::{OperatorError, OperatorResult};
use crate::jwt::{self, Token};
use crate::key::ObjectKey;

pub use eventhandler::controller_for_restapi;

/// Wait for slurmrestd to come up.
const NOT_READY_REQUEUE: Duration = Duration::from_secs(10);

/// How often informers poll Slurm for node changes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Builds Slurm clients.
pub trait SlurmClientFactory: Send + Sync {
    /// Create a client for `server` authenticating with `token`.
    fn create(&self, server: &str, token: &str) -> OperatorResult<SlurmClientRef>;
}

/// [`SlurmClientFactory`] producing REST clients.
#[derive(Debug, Clone, Default)]
pub struct RestClientFactory {
    timeout: Option<Duration>,
}

impl RestClientFactory {
    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl SlurmClientFactory for RestClientFactory {
    fn create(&self, server: &str, token: &str) -> OperatorResult<SlurmClientRef> {
        let mut options = ClientOptions {
            disable_for: vec![Capability::ControllerPing],
            ..Default::default()
        };
        if let Some(timeout) = self.timeout {
            options.timeout = timeout;
        }
        let client = slurm_client::Client::new(
            Config {
                server: server.to_string(),
                auth_token: token.to_string(),
            },
            options,
        )?;
        Ok(Arc::new(client))
    }
}

fn error_backoff_id(key: &ObjectKey) -> String {
    format!("controller:{}", key)
}

/// Controller for Slurm clients, reconciling Controller resources.
pub struct SlurmClientController {
    ctx: Arc<ControllerContext>,
    factory: Arc<dyn SlurmClientFactory>,
    events: mpsc::Sender<SlurmNodeEvent>,
    informers: Mutex<HashMap<ObjectKey, InformerHandle>>,
    durations: DurationStore,
    poll_interval: Duration,
}

impl SlurmClientController {
    /// Create a new SlurmClient controller.
    ///
    /// Node events of every client are sent to `events`.
    pub fn new(
        ctx: Arc<ControllerContext>,
        factory: Arc<dyn SlurmClientFactory>,
        events: mpsc::Sender<SlurmNodeEvent>,
    ) -> Self {
        Self {
            ctx,
            factory,
            events,
            informers: Mutex::new(HashMap::new()),
            durations: DurationStore::new(MergePolicy::Greater),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the informer poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Reconcile a Controller resource.
    pub async fn reconcile(&self, controller: Arc<Controller>) -> OperatorResult<ReconcileAction> {
        let key = ObjectKey::of(controller.as_ref());
        let start = Instant::now();
        tracing::debug!(controller = %key, "Started syncing Controller");

        let result = self.sync(&key).await;
        let requeue = self.durations.pop(&key.to_string());

        tracing::debug!(
            controller = %key,
            duration = ?start.elapsed(),
            requeue = ?requeue,
            "Finished syncing Controller"
        );

        result?;
        self.ctx.backoff.reset(&error_backoff_id(&key));
        Ok(ReconcileAction::after(requeue))
    }

    async fn sync(&self, key: &ObjectKey) -> OperatorResult<()> {
        let Some(controller) = self.ctx.kube.get_controller(key).await? else {
            tracing::debug!(controller = %key, "Controller has been deleted");
            self.remove_client(key);
            return Ok(());
        };

        let Some(restapi) = self.find_restapi(&controller, key).await? else {
            tracing::debug!(controller = %key, "No RestApi for Controller yet");
            self.remove_client(key);
            self.durations.push(&key.to_string(), NOT_READY_REQUEUE);
            return Ok(());
        };

        if !self.is_restapi_ready(&restapi).await? {
            tracing::debug!(
                controller = %key,
                restapi = %restapi.key(),
                "RestApi is not ready"
            );
            self.remove_client(key);
            self.durations.push(&key.to_string(), NOT_READY_REQUEUE);
            return Ok(());
        }

        let server = self
            .ctx
            .restapi_server_override
            .clone()
            .unwrap_or_else(|| restapi.server_url());

        let signing_key = self.signing_key(&controller).await?;
        let token = Token::new(&signing_key)
            .with_lifetime(jwt::DEFAULT_LIFETIME)
            .sign()?;
        let claims = jwt::parse_claims(&token, &signing_key)?;

        if self.durations.peek(&key.to_string()).is_zero() {
            let refresh = jwt::DEFAULT_LIFETIME * 4 / 5;
            tracing::debug!(
                controller = %key,
                expiration = ?claims.expiration(),
                refresh_in = ?refresh,
                "Refresh token before expiration"
            );
            self.durations.push(&key.to_string(), refresh);
        }

        if let Some(client) = self.ctx.client_map.get(key) {
            client.set_server(server)?;
            client.set_token(token);
            tracing::debug!(controller = %key, "Refreshed slurm client");
            return Ok(());
        }

        let client = self.factory.create(&server, &token)?;
        self.start_informer(key, client.clone());
        if self.ctx.client_map.add(key.clone(), client) {
            tracing::info!(controller = %key, server = %server, "Added slurm client");
        }
        Ok(())
    }

    async fn find_restapi(
        &self,
        controller: &Controller,
        key: &ObjectKey,
    ) -> OperatorResult<Option<RestApi>> {
        let namespace = controller.namespace().unwrap_or_default();
        let mut restapis: Vec<RestApi> = self
            .ctx
            .kube
            .list_restapis(&namespace)
            .await?
            .into_iter()
            .filter(|r| r.is_for_controller(key))
            .collect();
        restapis.sort_by_key(|r| r.name_any());
        Ok(restapis.into_iter().next())
    }

    async fn is_restapi_ready(&self, restapi: &RestApi) -> OperatorResult<bool> {
        let deployment = self.ctx.kube.get_deployment(&restapi.key()).await?;
        Ok(deployment
            .and_then(|d| d.status)
            .and_then(|s| s.ready_replicas)
            .is_some_and(|ready| ready > 0))
    }

    async fn signing_key(&self, controller: &Controller) -> OperatorResult<Vec<u8>> {
        let secret_key = controller.jwt_hs256_key();
        let selector = controller.jwt_hs256_ref();
        let secret = self
            .ctx
            .kube
            .get_secret(&secret_key)
            .await?
            .ok_or_else(|| {
                OperatorError::not_found("Secret", &secret_key.namespace, &secret_key.name)
            })?;
        secret
            .data
            .and_then(|mut data| data.remove(&selector.key))
            .map(|bytes| bytes.0)
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| {
                OperatorError::InvalidConfig(format!(
                    "secret {} has no key {}",
                    secret_key, selector.key
                ))
            })
    }

    fn start_informer(&self, key: &ObjectKey, client: SlurmClientRef) {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = NodeInformer::new(client, self.poll_interval).spawn(tx);

        let events = self.events.clone();
        let controller = key.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event = SlurmNodeEvent {
                    controller: controller.clone(),
                    event,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            tracing::debug!(controller = %controller, "Slurm node event forwarder stopped");
        });

        if let Some(previous) = self.informers.lock().insert(key.clone(), handle) {
            previous.stop();
        }
    }

    fn remove_client(&self, key: &ObjectKey) {
        if let Some(handle) = self.informers.lock().remove(key) {
            handle.stop();
        }
        if self.ctx.client_map.remove(key) {
            tracing::info!(controller = %key, "Removed slurm client");
        }
    }

    /// Number of running informers.
    pub fn informer_count(&self) -> usize {
        self.informers.lock().len()
    }
}

/// Error policy for the SlurmClient controller.
pub fn error_policy(
    controller: Arc<Controller>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = ObjectKey::of(controller.as_ref());
    tracing::error!(controller = %key, error = %error, "Controller reconciliation error");
    ctx.error_requeue(&error_backoff_id(&key), error)
}
