//! RestApi Custom Resource Definition.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ObjectReference;
use crate::key::ObjectKey;

/// Port slurmrestd listens on.
pub const SLURMRESTD_PORT: u16 = 6820;

/// RestApi is the Schema for the restapis API.
///
/// Each RestApi runs slurmrestd as a Deployment and Service sharing the
/// RestApi's name.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "slinky.slurm.net",
    version = "v1beta1",
    kind = "RestApi",
    plural = "restapis",
    namespaced,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestApiSpec {
    /// The Controller this slurmrestd talks to.
    pub controller_ref: ObjectReference,

    /// Number of slurmrestd replicas.
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

fn default_replicas() -> i32 {
    1
}

impl RestApi {
    /// Key of the RestApi, which is also the key of its Deployment.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace().unwrap_or_default(), &self.name_any())
    }

    /// Short service DNS name, `<name>.<namespace>`.
    pub fn service_fqdn_short(&self) -> String {
        format!(
            "{}.{}",
            self.name_any(),
            self.namespace().unwrap_or_default()
        )
    }

    /// Base URL of the slurmrestd service.
    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.service_fqdn_short(), SLURMRESTD_PORT)
    }

    /// Whether the RestApi serves the given Controller.
    pub fn is_for_controller(&self, controller: &ObjectKey) -> bool {
        self.spec
            .controller_ref
            .is_match(&self.namespace().unwrap_or_default(), controller)
    }
}
