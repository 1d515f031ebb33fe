//! NodeSet Custom Resource Definition.
//!
//! A NodeSet is a homogeneous pool of slurmd pods. Pods are addressed by
//! ordinal (`<nodeset>-<ordinal>`), carry the revision hash of the template
//! they were created from and are replaced according to the update strategy.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ObjectReference;
use crate::key::ObjectKey;
use crate::labels;

/// NodeSet is the Schema for the nodesets API.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "slinky.slurm.net",
    version = "v1beta1",
    kind = "NodeSet",
    plural = "nodesets",
    shortname = "nss",
    namespaced,
    status = "NodeSetStatus",
    scale = r#"{"specReplicasPath":".spec.replicas", "statusReplicasPath":".status.replicas", "labelSelectorPath":".status.selector"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Updated", "type":"integer", "jsonPath":".status.updatedReplicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Idle", "type":"integer", "jsonPath":".status.slurmIdle"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// The Controller (Slurm cluster) these nodes register with.
    pub controller_ref: ObjectReference,

    /// Desired number of pods. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Template for the slurmd pods.
    #[serde(default)]
    pub template: PodTemplateSpec,

    /// How pods are replaced when the template changes.
    #[serde(default)]
    pub update_strategy: NodeSetUpdateStrategy,

    /// What happens to PVCs created from `volumeClaimTemplates`.
    #[serde(default)]
    pub persistent_volume_claim_retention_policy: PvcRetentionPolicy,

    /// Claims each pod is given, named `<template>-<pod>`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,

    /// Seconds a pod must be ready before it counts as available.
    #[serde(default)]
    pub min_ready_seconds: i32,

    /// Number of old ControllerRevisions to keep.
    #[serde(default = "default_revision_history_limit")]
    pub revision_history_limit: i32,
}

fn default_revision_history_limit() -> i32 {
    10
}

/// Update strategy type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategyType {
    /// Replace stale pods automatically, bounded by `maxUnavailable`.
    RollingUpdate,
    /// Replace stale pods only when they are deleted by hand.
    OnDelete,
}

impl UpdateStrategyType {
    /// Accepted spelling of each variant.
    pub const VALUES: [&'static str; 2] = ["RollingUpdate", "OnDelete"];

    /// Parse `spec.updateStrategy.type`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RollingUpdate" => Some(Self::RollingUpdate),
            "OnDelete" => Some(Self::OnDelete),
            _ => None,
        }
    }
}

/// Update strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetUpdateStrategy {
    /// `RollingUpdate` or `OnDelete`.
    #[serde(rename = "type", default = "default_strategy_type")]
    pub type_: String,

    /// Parameters for `RollingUpdate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateNodeSetStrategy>,
}

impl Default for NodeSetUpdateStrategy {
    fn default() -> Self {
        Self {
            type_: default_strategy_type(),
            rolling_update: None,
        }
    }
}

fn default_strategy_type() -> String {
    "RollingUpdate".to_string()
}

/// Rolling update parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateNodeSetStrategy {
    /// Maximum pods that may be unavailable during the update, as a count
    /// or a percentage of replicas. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

/// PVC retention policy value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvcRetentionPolicyType {
    /// Keep the claim.
    Retain,
    /// Delete the claim.
    Delete,
}

impl PvcRetentionPolicyType {
    /// Accepted spelling of each variant.
    pub const VALUES: [&'static str; 2] = ["Retain", "Delete"];

    /// Parse a `persistentVolumeClaimRetentionPolicy` value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Retain" => Some(Self::Retain),
            "Delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// When PVCs created from `volumeClaimTemplates` are deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcRetentionPolicy {
    /// Policy when the NodeSet is deleted.
    #[serde(default = "default_retention")]
    pub when_deleted: String,

    /// Policy when the NodeSet is scaled down.
    #[serde(default = "default_retention")]
    pub when_scaled: String,
}

impl Default for PvcRetentionPolicy {
    fn default() -> Self {
        Self {
            when_deleted: default_retention(),
            when_scaled: default_retention(),
        }
    }
}

fn default_retention() -> String {
    "Retain".to_string()
}

/// NodeSet status, recomputed on every reconcile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetStatus {
    /// Pods matched by the selector.
    #[serde(default)]
    pub replicas: i32,

    /// Pods with a Ready condition.
    #[serde(default)]
    pub ready_replicas: i32,

    /// Pods ready for at least `minReadySeconds`.
    #[serde(default)]
    pub available_replicas: i32,

    /// Pods created from the update revision.
    #[serde(default)]
    pub updated_replicas: i32,

    /// `replicas - availableReplicas`.
    #[serde(default)]
    pub unavailable_replicas: i32,

    /// Slurm nodes in the IDLE state.
    #[serde(default)]
    pub slurm_idle: i32,

    /// Slurm nodes in the ALLOCATED or MIXED state.
    #[serde(default)]
    pub slurm_allocated: i32,

    /// Slurm nodes in the DOWN state.
    #[serde(default)]
    pub slurm_down: i32,

    /// Slurm nodes with the DRAIN flag.
    #[serde(default)]
    pub slurm_drain: i32,

    /// Hash of the update revision.
    #[serde(default)]
    pub node_set_hash: String,

    /// Count of hash collisions seen while creating revisions.
    #[serde(default)]
    pub collision_count: Option<i32>,

    /// Label selector of the pods, in string form.
    #[serde(default)]
    pub selector: String,

    /// Generation this status was computed from.
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl NodeSet {
    /// Namespace/name of the NodeSet.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace().unwrap_or_default(), &self.name_any())
    }

    /// Desired replica count.
    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    /// Key of the Controller this NodeSet belongs to.
    pub fn controller_key(&self) -> ObjectKey {
        self.spec
            .controller_ref
            .key(&self.namespace().unwrap_or_default())
    }

    /// Labels that select the NodeSet's pods.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        labels::selector_labels(labels::NODESET_APP, &self.name_any())
    }

    /// Canonical string form of the selector.
    pub fn selector(&self) -> String {
        labels::selector_string(&self.selector_labels())
    }

    /// Parsed update strategy, if valid.
    pub fn update_strategy(&self) -> Option<UpdateStrategyType> {
        UpdateStrategyType::parse(&self.spec.update_strategy.type_)
    }

    /// Resolved `maxUnavailable`, at least 1.
    pub fn max_unavailable(&self) -> i32 {
        let value = self
            .spec
            .update_strategy
            .rolling_update
            .as_ref()
            .and_then(|ru| ru.max_unavailable.as_ref());

        let resolved = match value {
            None => 1,
            Some(IntOrString::Int(n)) => *n,
            Some(IntOrString::String(s)) => match parse_percent(s) {
                Some(percent) => {
                    let scaled = i64::from(self.replicas()) * i64::from(percent) / 100;
                    i32::try_from(scaled).unwrap_or(i32::MAX)
                }
                None => 1,
            },
        };
        resolved.max(1)
    }

    /// PVC policy when scaling down.
    pub fn when_scaled(&self) -> PvcRetentionPolicyType {
        PvcRetentionPolicyType::parse(
            &self
                .spec
                .persistent_volume_claim_retention_policy
                .when_scaled,
        )
        .unwrap_or(PvcRetentionPolicyType::Retain)
    }
}

/// Parse an `N%` string into N. Only 0 through 100 are accepted.
pub fn parse_percent(value: &str) -> Option<i32> {
    let percent = value.strip_suffix('%')?.parse::<i32>().ok()?;
    (0..=100).contains(&percent).then_some(percent)
}
