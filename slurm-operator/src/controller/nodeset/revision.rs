//! ControllerRevision history for NodeSets.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use super::utils;
use crate::crd::NodeSet;
use crate::error::{OperatorError, OperatorResult};
use crate::key::ObjectKey;
use crate::kube_api::KubeApi;
use crate::labels;

const HASH_LEN: usize = 10;
const MAX_COLLISIONS: i32 = 32;

/// Revisions a sync works against.
#[derive(Debug, Clone)]
pub struct Revisions {
    /// Oldest revision an existing pod still runs.
    pub current: ControllerRevision,
    /// Revision new pods are created from.
    pub update: ControllerRevision,
    /// Collision count to persist in status.
    pub collision_count: i32,
}

impl Revisions {
    /// Hash of the update revision.
    pub fn update_hash(&self) -> &str {
        revision_hash(&self.update)
    }
}

/// Hash of a pod template, salted with the collision count.
pub fn hash_template(template: &PodTemplateSpec, collision_count: Option<i32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(template).unwrap_or_default());
    if let Some(count) = collision_count.filter(|c| *c > 0) {
        hasher.update(count.to_le_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()[..HASH_LEN]
        .to_string()
}

/// `controller-revision-hash` label of a revision.
pub fn revision_hash(revision: &ControllerRevision) -> &str {
    revision
        .labels()
        .get(labels::REVISION_HASH)
        .map(String::as_str)
        .unwrap_or_default()
}

fn revision_data(nodeset: &NodeSet) -> RawExtension {
    RawExtension(serde_json::json!({
        "spec": { "template": nodeset.spec.template }
    }))
}

/// Build the revision for the NodeSet's current template.
pub fn new_revision(nodeset: &NodeSet, revision: i64, collision_count: i32) -> ControllerRevision {
    let hash = hash_template(&nodeset.spec.template, Some(collision_count));
    let mut revision_labels = nodeset.selector_labels();
    revision_labels.insert(labels::REVISION_HASH.to_string(), hash.clone());

    ControllerRevision {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", nodeset.name_any(), hash)),
            namespace: nodeset.namespace(),
            labels: Some(revision_labels),
            owner_references: nodeset.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(revision_data(nodeset)),
        revision,
    }
}

/// Whether two revisions hold the same template.
pub fn equal_revision(a: &ControllerRevision, b: &ControllerRevision) -> bool {
    a.data == b.data
}

fn is_owned(revision: &ControllerRevision, nodeset: &NodeSet) -> bool {
    let Some(uid) = nodeset.uid() else {
        return false;
    };
    revision
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Owned revisions, oldest first.
pub async fn list_revisions(
    kube: &dyn KubeApi,
    nodeset: &NodeSet,
) -> OperatorResult<Vec<ControllerRevision>> {
    let namespace = nodeset.namespace().unwrap_or_default();
    let mut revisions: Vec<_> = kube
        .list_revisions(&namespace, &nodeset.selector_labels())
        .await?
        .into_iter()
        .filter(|r| is_owned(r, nodeset))
        .collect();
    revisions.sort_by(|a, b| {
        a.revision
            .cmp(&b.revision)
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
    Ok(revisions)
}

/// Resolve the current and update revisions, creating the update revision
/// when the template has none yet.
///
/// The current revision is the oldest one in `history` that a pod still
/// runs. Once every pod runs the update revision the two are the same.
pub async fn get_revisions(
    kube: &dyn KubeApi,
    nodeset: &NodeSet,
    history: &[ControllerRevision],
    pods: &[Pod],
) -> OperatorResult<Revisions> {
    let mut collision_count = nodeset
        .status
        .as_ref()
        .and_then(|s| s.collision_count)
        .unwrap_or(0);
    let next_number = history.iter().map(|r| r.revision).max().unwrap_or(0) + 1;

    let update = loop {
        let candidate = new_revision(nodeset, next_number, collision_count);

        if let Some(existing) = history.iter().rev().find(|r| equal_revision(r, &candidate)) {
            break existing.clone();
        }

        // Same name but different template means the hash collided.
        if history.iter().any(|r| r.name_any() == candidate.name_any()) {
            collision_count += 1;
        } else {
            match kube.create_revision(&candidate).await {
                Ok(created) => {
                    tracing::info!(
                        nodeset = %nodeset.key(),
                        revision = %created.name_any(),
                        "Created ControllerRevision"
                    );
                    break created;
                }
                Err(OperatorError::KubeError(kube::Error::Api(err))) if err.code == 409 => {
                    collision_count += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if collision_count > MAX_COLLISIONS {
            return Err(OperatorError::InvalidConfig(format!(
                "too many revision hash collisions for NodeSet {}",
                nodeset.key()
            )));
        }
    };

    let running: BTreeSet<&str> = pods.iter().map(utils::revision_hash).collect();
    let current = history
        .iter()
        .find(|r| running.contains(revision_hash(r)))
        .cloned()
        .unwrap_or_else(|| update.clone());

    Ok(Revisions {
        current,
        update,
        collision_count,
    })
}

/// Delete revisions beyond `revisionHistoryLimit`, oldest first.
///
/// Revisions that are current, the update target or still referenced by a
/// pod are never deleted.
pub async fn truncate_history(
    kube: &dyn KubeApi,
    nodeset: &NodeSet,
    history: &[ControllerRevision],
    revisions: &Revisions,
    pods: &[Pod],
) -> OperatorResult<()> {
    let live: BTreeSet<&str> = pods
        .iter()
        .map(utils::revision_hash)
        .chain([revision_hash(&revisions.current), revision_hash(&revisions.update)])
        .collect();

    let stale: Vec<_> = history
        .iter()
        .filter(|r| !live.contains(revision_hash(r)))
        .collect();

    let limit = nodeset.spec.revision_history_limit.max(0) as usize;
    let excess = stale.len().saturating_sub(limit);
    for revision in stale.into_iter().take(excess) {
        tracing::debug!(
            nodeset = %nodeset.key(),
            revision = %revision.name_any(),
            "Deleting old ControllerRevision"
        );
        kube.delete_revision(&ObjectKey::of(revision)).await?;
    }
    Ok(())
}
