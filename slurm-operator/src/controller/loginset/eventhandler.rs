//! Controller and Secret events to LoginSet reconcile requests.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;

use crate::crd::{Controller, LoginSet};
use crate::key::ObjectKey;

/// LoginSets that reference the Controller.
pub fn loginsets_for_controller(
    controller: &Controller,
    loginsets: &[Arc<LoginSet>],
) -> Vec<ObjectRef<LoginSet>> {
    let key = ObjectKey::of(controller);
    loginsets
        .iter()
        .filter(|loginset| loginset.controller_key() == key)
        .map(|loginset| ObjectRef::from_obj(loginset.as_ref()))
        .collect()
}

/// LoginSets that use the Secret, either as their `sssd.conf` or as the JWT
/// key of their Controller.
pub fn loginsets_for_secret(
    secret: &Secret,
    loginsets: &[Arc<LoginSet>],
    controllers: &[Arc<Controller>],
) -> Vec<ObjectRef<LoginSet>> {
    let key = ObjectKey::of(secret);
    let jwt_users: Vec<ObjectKey> = controllers
        .iter()
        .filter(|controller| controller.jwt_hs256_key() == key)
        .map(|controller| ObjectKey::of(controller.as_ref()))
        .collect();

    loginsets
        .iter()
        .filter(|loginset| {
            loginset.sssd_conf_key() == key || jwt_users.contains(&loginset.controller_key())
        })
        .map(|loginset| ObjectRef::from_obj(loginset.as_ref()))
        .collect()
}
