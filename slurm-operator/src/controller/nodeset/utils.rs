//! Pod helpers for NodeSets: naming, ownership and health predicates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::NodeSet;
use crate::key::ObjectKey;
use crate::labels;

/// Name of the pod at `ordinal`.
pub fn pod_name(nodeset: &NodeSet, ordinal: i32) -> String {
    format!("{}-{}", nodeset.name_any(), ordinal)
}

/// Ordinal encoded in a pod name, if it belongs to `parent`.
pub fn parse_ordinal(parent: &str, pod_name: &str) -> Option<i32> {
    pod_name
        .strip_prefix(parent)?
        .strip_prefix('-')?
        .parse::<i32>()
        .ok()
        .filter(|ordinal| *ordinal >= 0)
}

/// Ordinal of a NodeSet pod.
pub fn pod_ordinal(nodeset: &NodeSet, pod: &Pod) -> Option<i32> {
    parse_ordinal(&nodeset.name_any(), &pod.name_any())
}

/// Sort pods by ordinal; pods without one go last.
pub fn sort_by_ordinal(nodeset: &NodeSet, pods: &mut [Pod]) {
    pods.sort_by_key(|pod| pod_ordinal(nodeset, pod).unwrap_or(i32::MAX));
}

/// Name of the claim made from `template` for `pod_name`.
pub fn pvc_name(template: &str, pod_name: &str) -> String {
    format!("{}-{}", template, pod_name)
}

/// Claims a pod needs, from the NodeSet's `volumeClaimTemplates`.
pub fn new_pvcs(nodeset: &NodeSet, pod_name: &str) -> Vec<PersistentVolumeClaim> {
    nodeset
        .spec
        .volume_claim_templates
        .iter()
        .map(|template| {
            let mut pvc = template.clone();
            let mut claim_labels = template.metadata.labels.clone().unwrap_or_default();
            claim_labels.extend(nodeset.selector_labels());
            pvc.metadata = ObjectMeta {
                name: Some(pvc_name(&template.name_any(), pod_name)),
                namespace: nodeset.namespace(),
                labels: Some(claim_labels),
                annotations: template.metadata.annotations.clone(),
                ..Default::default()
            };
            pvc.status = None;
            pvc
        })
        .collect()
}

/// Build the pod at `ordinal` from the NodeSet's template.
pub fn new_nodeset_pod(nodeset: &NodeSet, ordinal: i32, revision_hash: &str) -> Pod {
    let name = pod_name(nodeset, ordinal);
    let template = &nodeset.spec.template;

    let mut pod_labels: BTreeMap<String, String> = template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    pod_labels.extend(nodeset.selector_labels());
    pod_labels.insert(labels::REVISION_HASH.to_string(), revision_hash.to_string());

    let mut spec: PodSpec = template.spec.clone().unwrap_or_default();
    spec.hostname = Some(name.clone());
    spec.subdomain = Some(nodeset.name_any());

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    for claim in &nodeset.spec.volume_claim_templates {
        let claim_template = claim.name_any();
        volumes.retain(|v| v.name != claim_template);
        volumes.push(Volume {
            name: claim_template.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(&claim_template, &name),
                read_only: None,
            }),
            ..Default::default()
        });
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: nodeset.namespace(),
            labels: Some(pod_labels),
            annotations: template.metadata.as_ref().and_then(|m| m.annotations.clone()),
            owner_references: nodeset.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// Whether the pod's controller reference is this NodeSet (UID checked).
pub fn is_owned_by(pod: &Pod, nodeset: &NodeSet) -> bool {
    let Some(uid) = nodeset.uid() else {
        return false;
    };
    pod.owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Revision hash label of a pod.
pub fn revision_hash(pod: &Pod) -> &str {
    pod.labels()
        .get(labels::REVISION_HASH)
        .map(String::as_str)
        .unwrap_or_default()
}

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

/// Pod phase is Running.
pub fn is_running(pod: &Pod) -> bool {
    phase(pod) == "Running"
}

/// Pod phase is Failed.
pub fn is_failed(pod: &Pod) -> bool {
    phase(pod) == "Failed"
}

/// Pod is being deleted.
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Pod has `Ready=True`.
pub fn is_ready(pod: &Pod) -> bool {
    ready_since(pod).is_some()
}

fn ready_since(pod: &Pod) -> Option<Option<DateTime<Utc>>> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready" && c.status == "True")
        .map(|c| c.last_transition_time.as_ref().map(|t| t.0))
}

/// Pod has been ready for at least `min_ready_seconds` at `now`.
pub fn is_available(pod: &Pod, min_ready_seconds: i32, now: DateTime<Utc>) -> bool {
    match ready_since(pod) {
        None => false,
        Some(_) if min_ready_seconds <= 0 => true,
        Some(None) => false,
        Some(Some(since)) => since + chrono::Duration::seconds(min_ready_seconds.into()) <= now,
    }
}

/// Slurm node name of a pod: its hostname, else its name.
pub fn slurm_node_name(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.hostname.clone())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| pod.name_any())
}

/// Kubernetes node the pod is scheduled on.
pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

/// Key of a pod.
pub fn pod_key(pod: &Pod) -> ObjectKey {
    ObjectKey::of(pod)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_pod_created, make_pod_healthy, new_nodeset};
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;

    #[test]
    fn ordinals() {
        assert_eq!(parse_ordinal("foo", "foo-3"), Some(3));
        assert_eq!(parse_ordinal("foo", "foo-bar-3"), None);
        assert_eq!(parse_ordinal("foo", "foo-"), None);
        assert_eq!(parse_ordinal("foo", "foo--1"), None);
        assert_eq!(parse_ordinal("foo", "bar-1"), None);
    }

    #[test]
    fn pod_from_template() {
        let mut nodeset = new_nodeset("foo", "slurm", 2);
        nodeset.spec.volume_claim_templates = vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec::default()),
            status: None,
        }];

        let pod = new_nodeset_pod(&nodeset, 1, "12345");
        assert_eq!(pod.name_any(), "foo-1");
        assert_eq!(pod.namespace().as_deref(), Some("default"));
        assert_eq!(revision_hash(&pod), "12345");
        assert_eq!(slurm_node_name(&pod), "foo-1");
        assert!(is_owned_by(&pod, &nodeset));

        let volumes = pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        let claim = volumes
            .iter()
            .find(|v| v.name == "data")
            .and_then(|v| v.persistent_volume_claim.as_ref())
            .unwrap();
        assert_eq!(claim.claim_name, "data-foo-1");

        let pvcs = new_pvcs(&nodeset, "foo-1");
        assert_eq!(pvcs[0].name_any(), "data-foo-1");
    }

    #[test]
    fn ownership_requires_uid_match() {
        let nodeset = new_nodeset("foo", "slurm", 1);
        let pod = new_nodeset_pod(&nodeset, 0, "");

        let mut impostor = new_nodeset("foo", "slurm", 1);
        impostor.metadata.uid = Some("another-uid".into());
        assert!(!is_owned_by(&pod, &impostor));
    }

    #[test]
    fn availability_window() {
        let mut nodeset = new_nodeset("foo", "slurm", 1);
        let healthy = make_pod_healthy(new_nodeset_pod(&nodeset, 0, ""));
        let created = make_pod_created(new_nodeset_pod(&nodeset, 1, ""));
        let now = Utc::now();

        assert!(is_ready(&healthy) && is_running(&healthy));
        assert!(is_available(&healthy, 0, now));
        assert!(!is_ready(&created) && !is_available(&created, 0, now));

        nodeset.spec.min_ready_seconds = 24 * 3600;
        assert!(!is_available(&healthy, nodeset.spec.min_ready_seconds, now));
    }
}
