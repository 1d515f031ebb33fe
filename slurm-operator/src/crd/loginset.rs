//! LoginSet Custom Resource Definition.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ObjectReference;
use crate::key::ObjectKey;
use crate::labels;

/// LoginSet is the Schema for the loginsets API.
///
/// Login pods give users shell access to a cluster. They run as a
/// Deployment named after the LoginSet.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "slinky.slurm.net",
    version = "v1beta1",
    kind = "LoginSet",
    plural = "loginsets",
    shortname = "lss",
    namespaced,
    status = "LoginSetStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoginSetSpec {
    /// The Controller (Slurm cluster) users log in to.
    pub controller_ref: ObjectReference,

    /// Number of login pods.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Template for the login pods.
    #[serde(default)]
    pub template: PodTemplateSpec,

    /// Secret key holding `sssd.conf`.
    pub sssd_conf_ref: SecretKeyRef,
}

fn default_replicas() -> i32 {
    1
}

/// Selects a key of a Secret in the LoginSet's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name.
    pub name: String,

    /// Key within the Secret.
    pub key: String,
}

/// LoginSet status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginSetStatus {
    /// Pods of the Deployment.
    #[serde(default)]
    pub replicas: i32,

    /// Ready pods of the Deployment.
    #[serde(default)]
    pub ready_replicas: i32,

    /// Label selector of the pods, in string form.
    #[serde(default)]
    pub selector: String,
}

impl LoginSet {
    /// Namespace/name of the LoginSet.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace().unwrap_or_default(), &self.name_any())
    }

    /// Key of the Controller this LoginSet belongs to.
    pub fn controller_key(&self) -> ObjectKey {
        self.spec
            .controller_ref
            .key(&self.namespace().unwrap_or_default())
    }

    /// Key of the `sssd.conf` Secret.
    pub fn sssd_conf_key(&self) -> ObjectKey {
        ObjectKey::new(
            &self.namespace().unwrap_or_default(),
            &self.spec.sssd_conf_ref.name,
        )
    }

    /// Labels that select the login pods.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        labels::selector_labels(labels::LOGINSET_APP, &self.name_any())
    }
}
