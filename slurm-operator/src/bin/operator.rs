//! Slurm Kubernetes Operator binary.
//!
//! This binary runs the NodeSet, SlurmClient and LoginSet controllers, which
//! manage Slurm custom resources in a Kubernetes cluster.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{reflector, watcher, Controller, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use slurm_operator::backoff::Backoff;
use slurm_operator::clientmap::ClientMap;
use slurm_operator::controller::loginset::{loginsets_for_controller, loginsets_for_secret};
use slurm_operator::controller::nodeset::{nodesets_for_slurm_event, NodeCache, NodeEventHandler};
use slurm_operator::controller::slurmclient::controller_for_restapi;
use slurm_operator::controller::{
    loginset_error_policy, nodeset_error_policy, slurmclient_error_policy, ControllerContext,
    LoginSetController, NodeSetController, RestClientFactory, SlurmClientController,
    SlurmNodeEvent,
};
use slurm_operator::crd::{Controller as SlurmController, LoginSet, NodeSet, RestApi};
use slurm_operator::kube_api::KubeClient;
use slurm_operator::labels;
use tokio::sync::{mpsc, watch};

/// Command line options.
#[derive(Debug, Parser)]
#[command(name = "slurm-operator", version, about)]
struct Args {
    /// Max concurrent workers for the NodeSet controller.
    #[arg(long, default_value_t = 1)]
    nodeset_workers: u16,

    /// Max concurrent workers for the SlurmClient controller.
    #[arg(long, default_value_t = 1)]
    slurmclient_workers: u16,

    /// Max concurrent workers for the LoginSet controller.
    #[arg(long, default_value_t = 1)]
    loginset_workers: u16,

    /// Print the CustomResourceDefinitions as YAML and exit.
    #[arg(long)]
    generate_crds: bool,

    /// Seconds between garbage collections of expired backoff entries.
    #[arg(long, default_value_t = 60)]
    backoff_gc_interval_secs: u64,

    /// slurmrestd URL to use instead of the in-cluster service address.
    #[arg(long, env = "SLURM_RESTAPI_OVERRIDE")]
    restapi_server_override: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.generate_crds {
        generate_crds()?;
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("slurm_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    tracing::info!("Starting Slurm Kubernetes Operator");

    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let backoff = Arc::new(Backoff::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    backoff.start_gc(Duration::from_secs(args.backoff_gc_interval_secs), shutdown_rx);

    let ctx = Arc::new(
        ControllerContext::new(
            Arc::new(KubeClient::new(client.clone())),
            Arc::new(ClientMap::new()),
            backoff,
        )
        .with_restapi_server_override(args.restapi_server_override.clone()),
    );

    let (slurm_tx, slurm_rx) = mpsc::channel(1024);

    let nodeset_controller = run_nodeset_controller(
        client.clone(),
        ctx.clone(),
        slurm_rx,
        args.nodeset_workers,
    );
    let slurmclient_controller = run_slurmclient_controller(
        client.clone(),
        ctx.clone(),
        slurm_tx,
        args.slurmclient_workers,
    );
    let loginset_controller =
        run_loginset_controller(client.clone(), ctx.clone(), args.loginset_workers);

    let result = tokio::select! {
        result = nodeset_controller => {
            tracing::info!("NodeSet controller exited");
            result
        }
        result = slurmclient_controller => {
            tracing::info!("SlurmClient controller exited");
            result
        }
        result = loginset_controller => {
            tracing::info!("LoginSet controller exited");
            result
        }
    };

    let _ = shutdown_tx.send(true);
    result
}

/// Stream over an unbounded channel.
fn unbounded_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> impl Stream<Item = T> + Send {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

/// Stream over a bounded channel.
fn bounded_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> impl Stream<Item = T> + Send {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

/// Watch Kubernetes nodes and request NodeSet reconciles on cordon changes.
fn spawn_node_watcher(
    client: Client,
    ctx: Arc<ControllerContext>,
) -> mpsc::UnboundedReceiver<ObjectRef<NodeSet>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = NodeEventHandler::new(ctx.kube.clone());

    tokio::spawn(async move {
        let nodes: Api<Node> = Api::all(client);
        let mut cache = NodeCache::default();
        let mut events = watcher(nodes, WatcherConfig::default()).default_backoff().boxed();

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "Node watch error");
                    continue;
                }
            };
            let Some(event) = cache.observe(event) else {
                continue;
            };
            if let Err(e) = handler.handle(&event, &tx).await {
                tracing::error!(error = %e, "Failed to handle Node event");
            }
        }
        tracing::info!("Node watcher stopped");
    });

    rx
}

/// Run the NodeSet controller.
async fn run_nodeset_controller(
    client: Client,
    ctx: Arc<ControllerContext>,
    slurm_events: mpsc::Receiver<SlurmNodeEvent>,
    workers: u16,
) -> anyhow::Result<()> {
    tracing::info!(workers, "Starting NodeSet controller");

    let nodesets: Api<NodeSet> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let reconciler = Arc::new(NodeSetController::new(ctx.clone()));

    let controller = Controller::new(nodesets, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(workers))
        .owns(
            pods,
            WatcherConfig::default().labels(&format!("{}={}", labels::NAME, labels::NODESET_APP)),
        );

    let store = controller.store();
    let slurm_triggers = bounded_stream(slurm_events).flat_map(move |event| {
        futures::stream::iter(nodesets_for_slurm_event(&event, &store.state()))
    });
    let node_triggers = unbounded_stream(spawn_node_watcher(client, ctx.clone()));

    controller
        .reconcile_on(node_triggers)
        .reconcile_on(slurm_triggers)
        .shutdown_on_signal()
        .run(
            move |nodeset, _ctx| {
                let reconciler = reconciler.clone();
                async move { reconciler.reconcile(nodeset).await.map(Action::from) }
            },
            nodeset_error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(nodeset = %obj.name, ?action, "Reconciled NodeSet");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "NodeSet controller stream error");
                }
            }
        })
        .await;

    Ok(())
}

/// Run the SlurmClient controller.
async fn run_slurmclient_controller(
    client: Client,
    ctx: Arc<ControllerContext>,
    slurm_events: mpsc::Sender<SlurmNodeEvent>,
    workers: u16,
) -> anyhow::Result<()> {
    tracing::info!(workers, "Starting SlurmClient controller");

    let controllers: Api<SlurmController> = Api::all(client.clone());
    let restapis: Api<RestApi> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let reconciler = Arc::new(SlurmClientController::new(
        ctx.clone(),
        Arc::new(RestClientFactory::default()),
        slurm_events,
    ));

    // Ready slurmrestd pods are picked up through the RestApi's Deployment,
    // which shares the RestApi's name.
    let restapi_store = {
        let (reader, writer) = reflector::store::<RestApi>();
        let stream = reflector(writer, watcher(restapis.clone(), WatcherConfig::default()))
            .default_backoff()
            .touched_objects();
        tokio::spawn(stream.for_each(|_| async {}));
        reader
    };

    Controller::new(controllers, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(workers))
        .watches(restapis, WatcherConfig::default(), controller_for_restapi)
        .watches(deployments, WatcherConfig::default(), move |deployment: Deployment| {
            let key = ObjectRef::<RestApi>::new(&deployment.name_any())
                .within(&deployment.namespace().unwrap_or_default());
            restapi_store
                .get(&key)
                .and_then(|restapi| controller_for_restapi((*restapi).clone()))
        })
        .shutdown_on_signal()
        .run(
            move |controller, _ctx| {
                let reconciler = reconciler.clone();
                async move { reconciler.reconcile(controller).await.map(Action::from) }
            },
            slurmclient_error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(controller = %obj.name, ?action, "Reconciled Controller");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SlurmClient controller stream error");
                }
            }
        })
        .await;

    Ok(())
}

/// Run the LoginSet controller.
async fn run_loginset_controller(
    client: Client,
    ctx: Arc<ControllerContext>,
    workers: u16,
) -> anyhow::Result<()> {
    tracing::info!(workers, "Starting LoginSet controller");

    let loginsets: Api<LoginSet> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());
    let reconciler = Arc::new(LoginSetController::new(ctx.clone()));

    let (controllers, writer) = reflector::store::<SlurmController>();
    let controller_events = reflector(
        writer,
        watcher(Api::<SlurmController>::all(client), WatcherConfig::default()),
    )
    .default_backoff()
    .touched_objects();

    let controller = Controller::new(loginsets, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(workers))
        .owns(
            deployments,
            WatcherConfig::default().labels(&format!("{}={}", labels::NAME, labels::LOGINSET_APP)),
        );

    let for_controller = controller.store();
    let for_secret = controller.store();

    controller
        .watches_stream(controller_events, move |slurm_controller| {
            loginsets_for_controller(&slurm_controller, &for_controller.state())
        })
        .watches(secrets, WatcherConfig::default(), move |secret| {
            loginsets_for_secret(&secret, &for_secret.state(), &controllers.state())
        })
        .shutdown_on_signal()
        .run(
            move |loginset, _ctx| {
                let reconciler = reconciler.clone();
                async move { reconciler.reconcile(loginset).await.map(Action::from) }
            },
            loginset_error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(loginset = %obj.name, ?action, "Reconciled LoginSet");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "LoginSet controller stream error");
                }
            }
        })
        .await;

    Ok(())
}

/// Generate CRD YAML files.
fn generate_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&SlurmController::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&RestApi::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&NodeSet::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&LoginSet::crd())?);
    Ok(())
}
