//! Custom Resource Definitions for the Slurm operator.
//!
//! All resources live in the `slinky.slurm.net/v1beta1` API group:
//!
//! - [`Controller`]: a Slurm cluster's slurmctld and its auth key
//! - [`RestApi`]: slurmrestd serving a [`Controller`]
//! - [`NodeSet`]: a scalable, rolling-updatable pool of slurmd pods
//! - [`LoginSet`]: login pods for a cluster

mod controller;
mod loginset;
mod nodeset;
mod restapi;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use controller::{Controller, ControllerSpec, JwtSecretKeySelector};
pub use loginset::{LoginSet, LoginSetSpec, LoginSetStatus, SecretKeyRef};
pub use nodeset::{
    NodeSet, NodeSetSpec, NodeSetStatus, NodeSetUpdateStrategy, PvcRetentionPolicy,
    PvcRetentionPolicyType, RollingUpdateNodeSetStrategy, UpdateStrategyType,
};
pub use restapi::{RestApi, RestApiSpec};

use crate::key::ObjectKey;

/// API group of every resource in this module.
pub const GROUP: &str = "slinky.slurm.net";

/// API version of every resource in this module.
pub const VERSION: &str = "v1beta1";

/// `apiVersion` string written into owner references.
pub const API_VERSION: &str = "slinky.slurm.net/v1beta1";

/// A reference to another object by namespace and name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// Namespace of the referent. Defaults to the referrer's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Name of the referent.
    pub name: String,
}

impl ObjectReference {
    /// Resolve the reference against the namespace of the referring object.
    pub fn key(&self, default_namespace: &str) -> ObjectKey {
        let namespace = self
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace);
        ObjectKey::new(namespace, &self.name)
    }

    /// Whether the reference points at `key`.
    pub fn is_match(&self, default_namespace: &str, key: &ObjectKey) -> bool {
        self.key(default_namespace) == *key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_defaults_namespace() {
        let r = ObjectReference {
            namespace: None,
            name: "slurm".into(),
        };
        assert_eq!(r.key("slinky"), ObjectKey::new("slinky", "slurm"));

        let r = ObjectReference {
            namespace: Some("other".into()),
            name: "slurm".into(),
        };
        assert!(r.is_match("slinky", &ObjectKey::new("other", "slurm")));
        assert!(!r.is_match("slinky", &ObjectKey::new("slinky", "slurm")));
    }
}
