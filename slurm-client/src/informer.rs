//! Polling informer that turns node list snapshots into change events.

use crate::client::SlurmApi;
use crate::types::Node;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// A change observed between two node list snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// A node appeared.
    Added(Node),
    /// A node's state or reason changed.
    Updated(Node),
    /// A node disappeared.
    Removed(Node),
}

impl NodeEvent {
    /// The node the event is about.
    pub fn node(&self) -> &Node {
        match self {
            NodeEvent::Added(node) | NodeEvent::Updated(node) | NodeEvent::Removed(node) => node,
        }
    }
}

/// Compare two snapshots keyed by node name.
pub fn diff_nodes(previous: &HashMap<String, Node>, current: &HashMap<String, Node>) -> Vec<NodeEvent> {
    let mut events = Vec::new();

    for (name, node) in current {
        match previous.get(name) {
            None => events.push(NodeEvent::Added(node.clone())),
            Some(old) if old.state != node.state || old.reason != node.reason => {
                events.push(NodeEvent::Updated(node.clone()))
            }
            Some(_) => {}
        }
    }
    for (name, node) in previous {
        if !current.contains_key(name) {
            events.push(NodeEvent::Removed(node.clone()));
        }
    }

    events.sort_by(|a, b| a.node().name.cmp(&b.node().name));
    events
}

/// Stops the informer task when dropped or when [`InformerHandle::stop`] is called.
#[derive(Debug)]
pub struct InformerHandle {
    stop: watch::Sender<bool>,
}

impl InformerHandle {
    /// Signal the informer to exit.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for InformerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Periodically lists nodes and reports changes.
pub struct NodeInformer {
    api: Arc<dyn SlurmApi>,
    interval: Duration,
}

impl NodeInformer {
    /// Create an informer over a client.
    pub fn new(api: Arc<dyn SlurmApi>, interval: Duration) -> Self {
        Self { api, interval }
    }

    /// Spawn the polling loop on the current runtime.
    ///
    /// The loop ends when the handle is stopped or the receiver is dropped.
    pub fn spawn(self, events: mpsc::Sender<NodeEvent>) -> InformerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(self.run(events, stop_rx));
        InformerHandle { stop: stop_tx }
    }

    async fn run(self, events: mpsc::Sender<NodeEvent>, mut stop: watch::Receiver<bool>) {
        let mut known: HashMap<String, Node> = HashMap::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let nodes = match self.api.list_nodes().await {
                Ok(nodes) => nodes,
                Err(e) => {
                    tracing::debug!(server = %self.api.server(), error = %e, "Node informer list failed");
                    continue;
                }
            };

            let current: HashMap<String, Node> =
                nodes.into_iter().map(|n| (n.name.clone(), n)).collect();

            for event in diff_nodes(&known, &current) {
                if events.send(event).await.is_err() {
                    tracing::debug!("Node informer receiver closed");
                    return;
                }
            }
            known = current;
        }

        tracing::debug!(server = %self.api.server(), "Node informer stopped");
    }
}
