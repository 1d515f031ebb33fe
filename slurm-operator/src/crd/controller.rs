//! Controller Custom Resource Definition.
//!
//! A Controller represents one Slurm cluster (its slurmctld). The operator
//! keeps a REST client per Controller and signs its tokens with the
//! referenced HS256 key.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::key::ObjectKey;

/// Controller is the Schema for the controllers API.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "slinky.slurm.net",
    version = "v1beta1",
    kind = "Controller",
    plural = "controllers",
    namespaced,
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSpec {
    /// Slurm `ClusterName`. Defaults to the Controller's name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,

    /// Secret key holding the Slurm `auth/jwt` HS256 signing key.
    pub jwt_hs256_key_ref: JwtSecretKeySelector,
}

/// Selects a key of a Secret, optionally in another namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JwtSecretKeySelector {
    /// Secret name.
    pub name: String,

    /// Key within the Secret.
    pub key: String,

    /// Secret namespace. Defaults to the Controller's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Controller {
    /// Slurm cluster name.
    pub fn cluster_name(&self) -> String {
        if self.spec.cluster_name.is_empty() {
            self.name_any()
        } else {
            self.spec.cluster_name.clone()
        }
    }

    /// The JWT key reference with its namespace filled in.
    pub fn jwt_hs256_ref(&self) -> JwtSecretKeySelector {
        let mut selector = self.spec.jwt_hs256_key_ref.clone();
        if selector.namespace.as_deref().unwrap_or_default().is_empty() {
            selector.namespace = Some(self.namespace().unwrap_or_default());
        }
        selector
    }

    /// Key of the Secret holding the JWT signing key.
    pub fn jwt_hs256_key(&self) -> ObjectKey {
        let selector = self.jwt_hs256_ref();
        ObjectKey::new(
            selector.namespace.as_deref().unwrap_or_default(),
            &selector.name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(cluster_name: &str, key_namespace: Option<&str>) -> Controller {
        let mut controller = Controller::new(
            "slurm",
            ControllerSpec {
                cluster_name: cluster_name.to_string(),
                jwt_hs256_key_ref: JwtSecretKeySelector {
                    name: "slurm-auth-jwths256".into(),
                    key: "jwt_hs256.key".into(),
                    namespace: key_namespace.map(str::to_string),
                },
            },
        );
        controller.metadata.namespace = Some("slinky".into());
        controller
    }

    #[test]
    fn cluster_name_defaults_to_object_name() {
        assert_eq!(controller("", None).cluster_name(), "slurm");
        assert_eq!(controller("hpc", None).cluster_name(), "hpc");
    }

    #[test]
    fn jwt_key_defaults_namespace() {
        assert_eq!(
            controller("", None).jwt_hs256_key(),
            ObjectKey::new("slinky", "slurm-auth-jwths256")
        );
        assert_eq!(
            controller("", Some("secrets")).jwt_hs256_key(),
            ObjectKey::new("secrets", "slurm-auth-jwths256")
        );
    }
}
