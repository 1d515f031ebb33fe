//! Deployment for a LoginSet.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    KeyToPath, PodTemplateSpec, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::crd::LoginSet;

/// Pod annotation with the hash of `sssd.conf`; a change rolls the pods.
pub const SSSD_CONF_HASH_ANNOTATION: &str = "slinky.slurm.net/sssd-conf-hash";

/// Pod annotation with the hash of the cluster's JWT key.
pub const JWT_KEY_HASH_ANNOTATION: &str = "slinky.slurm.net/jwt-key-hash";

const SSSD_VOLUME: &str = "sssd-conf";
const SSSD_CONF_PATH: &str = "/etc/sssd/sssd.conf";
const SSSD_CONF_FILE: &str = "sssd.conf";

/// Hex sha256 over a Secret's data, in key order.
pub fn secret_hash(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in secret.data.iter().flatten() {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(&value.0);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Build the login Deployment.
///
/// The pod template is the LoginSet's, with the selector labels forced on,
/// `sssd.conf` mounted into every container and the secret hashes recorded
/// as annotations.
pub fn build_deployment(loginset: &LoginSet, sssd_conf: &Secret, jwt_key: &Secret) -> Deployment {
    let selector = loginset.selector_labels();

    let mut template: PodTemplateSpec = loginset.spec.template.clone();
    let meta = template.metadata.get_or_insert_with(Default::default);
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(selector.clone());
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(SSSD_CONF_HASH_ANNOTATION.to_string(), secret_hash(sssd_conf));
    annotations.insert(JWT_KEY_HASH_ANNOTATION.to_string(), secret_hash(jwt_key));

    let pod_spec = template.spec.get_or_insert_with(Default::default);
    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    volumes.retain(|v| v.name != SSSD_VOLUME);
    volumes.push(Volume {
        name: SSSD_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(loginset.spec.sssd_conf_ref.name.clone()),
            items: Some(vec![KeyToPath {
                key: loginset.spec.sssd_conf_ref.key.clone(),
                path: SSSD_CONF_FILE.to_string(),
                mode: None,
            }]),
            default_mode: Some(0o600),
            optional: None,
        }),
        ..Default::default()
    });
    for container in &mut pod_spec.containers {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        mounts.retain(|m| m.name != SSSD_VOLUME);
        mounts.push(VolumeMount {
            name: SSSD_VOLUME.to_string(),
            mount_path: SSSD_CONF_PATH.to_string(),
            sub_path: Some(SSSD_CONF_FILE.to_string()),
            read_only: Some(true),
            ..Default::default()
        });
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(loginset.name_any()),
            namespace: loginset.namespace(),
            labels: Some(selector.clone()),
            owner_references: loginset.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(loginset.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels;
    use crate::testing;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn fixtures() -> (LoginSet, Secret, Secret) {
        let mut loginset = testing::new_loginset("login", "slurm");
        loginset.spec.replicas = 2;
        loginset.spec.template.spec = Some(PodSpec {
            containers: vec![Container {
                name: "login".into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let sssd = testing::new_sssd_secret(&loginset, "[sssd]\n");
        let jwt = testing::new_jwt_secret(&testing::new_controller("slurm"));
        (loginset, sssd, jwt)
    }

    #[test]
    fn deployment_selects_login_pods() {
        let (loginset, sssd, jwt) = fixtures();
        let deployment = build_deployment(&loginset, &sssd, &jwt);

        assert_eq!(deployment.metadata.name.as_deref(), Some("login"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some(testing::NAMESPACE));
        let owner = &deployment.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "LoginSet");
        assert_eq!(owner.controller, Some(true));

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector.get(labels::NAME).map(String::as_str), Some("login"));
        assert_eq!(selector.get(labels::INSTANCE).map(String::as_str), Some("login"));

        let template_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert!(labels::matches(&selector, Some(&template_labels)));
    }

    #[test]
    fn sssd_conf_is_mounted() {
        let (loginset, sssd, jwt) = fixtures();
        let deployment = build_deployment(&loginset, &sssd, &jwt);
        let pod = deployment.spec.unwrap().template.spec.unwrap();

        let volume = &pod.volumes.unwrap()[0];
        let source = volume.secret.as_ref().unwrap();
        assert_eq!(source.secret_name.as_deref(), Some("login-sssd"));
        assert_eq!(source.items.as_ref().unwrap()[0].key, "sssd.conf");

        let mount = &pod.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, SSSD_CONF_PATH);
        assert_eq!(mount.sub_path.as_deref(), Some(SSSD_CONF_FILE));
    }

    #[test]
    fn secret_change_changes_annotation() {
        let (loginset, sssd, jwt) = fixtures();
        let before = build_deployment(&loginset, &sssd, &jwt);
        let changed = testing::new_sssd_secret(&loginset, "[sssd]\ndomains = ldap\n");
        let after = build_deployment(&loginset, &changed, &jwt);

        let hash = |d: &Deployment| {
            d.spec.as_ref().unwrap().template.metadata.as_ref().unwrap()
                .annotations.as_ref().unwrap()[SSSD_CONF_HASH_ANNOTATION].clone()
        };
        assert_ne!(hash(&before), hash(&after));
        assert_eq!(hash(&before), hash(&build_deployment(&loginset, &sssd, &jwt)));
    }
}
