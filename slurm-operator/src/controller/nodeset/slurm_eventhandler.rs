//! Slurm node events to NodeSet reconcile requests.

use std::sync::Arc;

use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use super::utils;
use crate::controller::SlurmNodeEvent;
use crate::crd::NodeSet;

/// NodeSets of the event's Controller that own the reported Slurm node.
///
/// Slurm node names are pod hostnames (`<nodeset>-<ordinal>`), so the owner
/// is found by name.
pub fn nodesets_for_slurm_event(
    event: &SlurmNodeEvent,
    nodesets: &[Arc<NodeSet>],
) -> Vec<ObjectRef<NodeSet>> {
    let node_name = &event.event.node().name;
    nodesets
        .iter()
        .filter(|nodeset| nodeset.controller_key() == event.controller)
        .filter(|nodeset| utils::parse_ordinal(&nodeset.name_any(), node_name).is_some())
        .map(|nodeset| ObjectRef::from_obj(nodeset.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ObjectKey;
    use crate::testing;
    use slurm_client::{Node, NodeEvent};

    fn event(controller: &str, node: &str) -> SlurmNodeEvent {
        SlurmNodeEvent {
            controller: ObjectKey::new("default", controller),
            event: NodeEvent::Updated(Node::new(node, &["IDLE", "DRAIN"])),
        }
    }

    #[test]
    fn maps_node_to_owning_nodeset() {
        let nodesets = vec![
            Arc::new(testing::new_nodeset("cpu", "slurm", 2)),
            Arc::new(testing::new_nodeset("gpu", "slurm", 2)),
            Arc::new(testing::new_nodeset("cpu", "other", 2)),
        ];

        let refs = nodesets_for_slurm_event(&event("slurm", "gpu-1"), &nodesets);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "gpu");

        assert!(nodesets_for_slurm_event(&event("slurm", "login-0"), &nodesets).is_empty());
        assert!(nodesets_for_slurm_event(&event("missing", "cpu-0"), &nodesets).is_empty());
    }
}
